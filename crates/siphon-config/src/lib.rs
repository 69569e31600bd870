// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Published-nodes configuration for the Siphon OPC UA bridge.
//!
//! Operators declare the nodes to publish in a JSON file; this crate owns
//! the schema of that file, the loading rules (including the `_GW_PNFP`
//! path override), and the atomic rewrite the engine performs whenever the
//! live configuration changes.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod error;
pub mod loader;
pub mod schema;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigFile, CONFIG_PATH_ENV, DEFAULT_CONFIG_FILE};
pub use schema::{
    LegacyNodeId, OpcNodeEntry, PublishedNodesEntry, DEFAULT_PUBLISHING_INTERVAL_MS,
    DEFAULT_SAMPLING_INTERVAL_MS,
};
