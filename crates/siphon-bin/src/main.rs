// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Siphon binary entry point.

mod cli;
mod logging;
mod runtime;
mod shutdown;

use clap::Parser;
use tracing::error;

use crate::cli::Cli;

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let cli = Cli::parse();
    logging::init_logging(&cli.log_level, cli.log_format);

    if let Err(e) = runtime::run(cli).await {
        error!(error = %e, "Startup failed");
        std::process::exit(1);
    }
}
