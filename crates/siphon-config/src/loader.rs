// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Loading and persisting the published-nodes file.
//!
//! Path resolution order: explicit path (CLI) over the `_GW_PNFP`
//! environment variable over `publishednodes.json` in the working
//! directory.
//!
//! Writes go through a sibling temp file followed by a rename so a crash
//! mid-write never leaves a truncated file behind.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{ConfigError, ConfigResult};
use crate::schema::PublishedNodesEntry;

/// Environment variable overriding the published-nodes file path.
pub const CONFIG_PATH_ENV: &str = "_GW_PNFP";

/// Default published-nodes file name.
pub const DEFAULT_CONFIG_FILE: &str = "publishednodes.json";

// =============================================================================
// ConfigFile
// =============================================================================

/// Handle to the published-nodes file on disk.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    path: PathBuf,
}

impl ConfigFile {
    /// Creates a handle for an explicit path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Resolves the file path: explicit argument, then `_GW_PNFP`, then
    /// the default file name.
    pub fn resolve(explicit: Option<PathBuf>) -> Self {
        let path = explicit
            .or_else(|| env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        debug!(path = %path.display(), "Resolved published-nodes file path");
        Self { path }
    }

    /// Returns the resolved path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads and validates all entries.
    pub fn read_entries(&self) -> ConfigResult<Vec<PublishedNodesEntry>> {
        if !self.path.exists() {
            return Err(ConfigError::file_not_found(&self.path));
        }

        let content =
            fs::read_to_string(&self.path).map_err(|e| ConfigError::io(&self.path, e))?;

        let entries: Vec<PublishedNodesEntry> = serde_json::from_str(&content)
            .map_err(|e| ConfigError::parse(&self.path, e.to_string()))?;

        for entry in &entries {
            entry.validate()?;
        }

        info!(
            path = %self.path.display(),
            entries = entries.len(),
            "Published-nodes file loaded"
        );
        Ok(entries)
    }

    /// Writes entries as indented JSON, atomically.
    ///
    /// The payload is written to a sibling `.tmp` file and renamed over
    /// the target, so readers never observe a partial file.
    pub fn write_entries(&self, entries: &[PublishedNodesEntry]) -> ConfigResult<()> {
        let json = serde_json::to_string_pretty(entries)
            .map_err(|e| ConfigError::serialization(e.to_string()))?;

        let tmp = self.temp_path();
        fs::write(&tmp, json.as_bytes()).map_err(|e| ConfigError::io(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            // Clean up the orphaned temp file; the original is untouched.
            let _ = fs::remove_file(&tmp);
            ConfigError::io(&self.path, e)
        })?;

        debug!(
            path = %self.path.display(),
            entries = entries.len(),
            "Published-nodes file written"
        );
        Ok(())
    }

    /// Like [`write_entries`](Self::write_entries), but a failure is
    /// logged and swallowed. In-memory state stays authoritative while
    /// the process runs; the next successful rewrite repairs the file.
    pub fn write_entries_best_effort(&self, entries: &[PublishedNodesEntry]) {
        if let Err(e) = self.write_entries(entries) {
            warn!(
                path = %self.path.display(),
                error = %e,
                "Failed to persist published-nodes file; continuing with in-memory state"
            );
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| DEFAULT_CONFIG_FILE.into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

// =============================================================================
// Tests
// =============================================================================
