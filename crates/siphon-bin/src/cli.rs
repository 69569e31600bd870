// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Command-line interface definition.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Siphon - OPC UA to cloud telemetry bridge.
///
/// Reads a published-nodes file, maintains one session per OPC UA
/// endpoint, and forwards value changes to the egress queue.
#[derive(Debug, Parser)]
#[command(name = "siphon", version, about = "Siphon OPC UA bridge", long_about = None)]
pub struct Cli {
    /// Path to the published-nodes file.
    ///
    /// Falls back to the `_GW_PNFP` environment variable, then to
    /// `publishednodes.json` in the working directory.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Reconciliation tick interval in seconds.
    #[arg(long, default_value_t = 10)]
    pub reconcile_interval_secs: u64,

    /// Requested session timeout in milliseconds (also the connect
    /// backoff base).
    #[arg(long, default_value_t = 10_000)]
    pub session_timeout_ms: u64,

    /// Keep-alive interval in seconds.
    #[arg(long, default_value_t = 2)]
    pub keep_alive_interval_secs: u64,

    /// Consecutive missed keep-alives before the session disconnects.
    #[arg(long, default_value_t = 5)]
    pub keep_alive_threshold: u32,

    /// Default sampling interval in milliseconds.
    #[arg(long, default_value_t = 1000)]
    pub sampling_interval_ms: u64,

    /// Default publishing interval in milliseconds.
    #[arg(long, default_value_t = 1000)]
    pub publishing_interval_ms: u64,

    /// Read each node's DisplayName from the server instead of using
    /// the node id.
    #[arg(long, default_value_t = false)]
    pub fetch_display_name: bool,

    /// Shopfloor domain appended to the envelope ApplicationUri.
    #[arg(long)]
    pub shopfloor_domain: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// Log output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable text (default).
    Text,
    /// JSON lines for log aggregation.
    Json,
    /// Minimal single-line output.
    Compact,
}
