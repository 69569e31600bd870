// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Runtime wiring: configuration, engine, egress, shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info};

use siphon_config::ConfigFile;
use siphon_egress::MemoryQueue;
use siphon_opcua::{
    PublisherSettings, RealUaTransport, SessionConfig, SessionRegistry, UaResult,
};

use crate::cli::Cli;
use crate::shutdown::ShutdownCoordinator;

/// Builds and runs the bridge until a termination signal arrives.
pub async fn run(cli: Cli) -> UaResult<()> {
    let coordinator = ShutdownCoordinator::new();

    let settings = PublisherSettings {
        session: SessionConfig {
            session_timeout_ms: cli.session_timeout_ms,
            keep_alive_interval: Duration::from_secs(cli.keep_alive_interval_secs),
            keep_alive_disconnect_threshold: cli.keep_alive_threshold,
            fetch_display_name: cli.fetch_display_name,
            application_name: "siphon".to_string(),
            shopfloor_domain: cli.shopfloor_domain.clone(),
        },
        default_sampling_interval_ms: cli.sampling_interval_ms,
        default_publishing_interval_ms: cli.publishing_interval_ms,
    };

    let config = ConfigFile::resolve(cli.config.clone());
    info!(path = %config.path().display(), "Using published-nodes file");

    let (queue, egress_rx) = MemoryQueue::new();
    let transport = Arc::new(RealUaTransport::new());
    let registry = SessionRegistry::new(
        transport,
        queue.clone(),
        settings,
        config,
        coordinator.token(),
    );

    // A broken published-nodes file at startup is fatal; at runtime the
    // in-memory state is authoritative and write failures are tolerated.
    let nodes = registry.bootstrap().await?;
    info!(nodes, "Bootstrap complete");

    let uploader = tokio::spawn(drain_egress(egress_rx));

    let driver = {
        let registry = Arc::clone(&registry);
        let interval = Duration::from_secs(cli.reconcile_interval_secs.max(1));
        tokio::spawn(async move { registry.run(interval).await })
    };
    // First tick immediately instead of waiting out the interval.
    registry.kick();

    coordinator.wait_for_shutdown().await;

    // Wake the driver so it observes the shutdown promptly.
    registry.kick();
    if let Err(e) = driver.await {
        error!(error = %e, "Reconciliation driver ended abnormally");
    }

    registry.shutdown_all().await;

    // The queue's last sender lives in the registry sessions; dropping
    // them above lets the uploader drain and finish.
    drop(registry);
    drop(queue);
    if let Err(e) = uploader.await {
        error!(error = %e, "Egress drain ended abnormally");
    }

    info!("Bridge stopped");
    Ok(())
}

/// Forwards encoded envelopes to the upload path.
///
/// The cloud uploader proper is not part of this bridge; envelopes are
/// surfaced on the trace log where a downstream shipper picks them up.
async fn drain_egress(mut rx: mpsc::UnboundedReceiver<String>) {
    let mut forwarded = 0u64;
    while let Some(payload) = rx.recv().await {
        forwarded += 1;
        debug!(target: "siphon::egress", %payload, "Envelope forwarded");
    }
    info!(forwarded, "Egress drained");
}
