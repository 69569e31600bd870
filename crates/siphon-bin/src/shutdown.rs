// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Graceful shutdown coordination.
//!
//! Handles SIGTERM/SIGINT (Ctrl+C on Windows), broadcasts the shutdown
//! to subscribed tasks, and mirrors the decision into the engine's
//! [`ShutdownToken`] so mutators and the reconciler observe it.

use tokio::sync::broadcast;
use tracing::info;

use siphon_opcua::ShutdownToken;

/// Coordinates graceful shutdown across the runtime's tasks.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    sender: broadcast::Sender<()>,
    token: ShutdownToken,
}

impl ShutdownCoordinator {
    /// Creates a new coordinator.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self {
            sender,
            token: ShutdownToken::new(),
        }
    }

    /// The engine-facing token.
    pub fn token(&self) -> ShutdownToken {
        self.token.clone()
    }

    /// Subscribes to shutdown notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }

    /// Initiates shutdown. Idempotent.
    pub fn initiate_shutdown(&self) {
        if !self.token.is_shutdown_requested() {
            info!("Shutdown initiated");
            self.token.request_shutdown();
            let _ = self.sender.send(());
        }
    }

    /// Waits for a termination signal (or a manual initiation) and
    /// broadcasts it.
    pub async fn wait_for_shutdown(&self) {
        if self.token.is_shutdown_requested() {
            return;
        }

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut sigterm =
                signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
            let mut sigint =
                signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");

            let mut manual = self.subscribe();
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = sigint.recv() => info!("Received SIGINT"),
                _ = manual.recv() => {}
            }
        }

        #[cfg(windows)]
        {
            let mut manual = self.subscribe();
            tokio::select! {
                r = tokio::signal::ctrl_c() => {
                    r.expect("failed to register Ctrl+C handler");
                    info!("Received Ctrl+C");
                }
                _ = manual.recv() => {}
            }
        }

        self.initiate_shutdown();
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
