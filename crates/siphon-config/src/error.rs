// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Error types for published-nodes configuration handling.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Result alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading, validating, or persisting the
/// published-nodes file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file does not exist.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path that was probed.
        path: PathBuf,
    },

    /// Reading or writing the file failed at the I/O layer.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// The file involved.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file content is not valid JSON for the expected schema.
    #[error("Failed to parse {path}: {message}")]
    Parse {
        /// The file involved.
        path: PathBuf,
        /// Parser diagnostics.
        message: String,
    },

    /// Serializing the live state back to JSON failed.
    #[error("Serialization failed: {message}")]
    Serialization {
        /// Serializer diagnostics.
        message: String,
    },

    /// An entry violates the schema rules.
    #[error("Invalid entry for endpoint '{endpoint}': {message}")]
    InvalidEntry {
        /// Endpoint URL of the offending entry.
        endpoint: String,
        /// What is wrong with it.
        message: String,
    },
}

impl ConfigError {
    /// Creates a file-not-found error.
    pub fn file_not_found(path: impl AsRef<Path>) -> Self {
        Self::FileNotFound {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Creates an I/O error.
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Creates a parse error.
    pub fn parse(path: impl AsRef<Path>, message: impl Into<String>) -> Self {
        Self::Parse {
            path: path.as_ref().to_path_buf(),
            message: message.into(),
        }
    }

    /// Creates a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates an invalid-entry error.
    pub fn invalid_entry(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidEntry {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }
}
