// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! The process-wide session registry.
//!
//! Owns the set of sessions keyed by endpoint URL (compared
//! case-insensitively on the absolute URI), runs the periodic
//! reconciliation driver, and persists configuration changes back to the
//! published-nodes file.
//!
//! Lock order is Registry -> Config -> Session. The registry mutex is
//! never taken while a session mutex is held.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info};
use url::Url;

use siphon_config::{
    ConfigFile, OpcNodeEntry, PublishedNodesEntry, DEFAULT_PUBLISHING_INTERVAL_MS,
    DEFAULT_SAMPLING_INTERVAL_MS,
};
use siphon_egress::TelemetrySink;

use crate::error::UaResult;
use crate::session::{Session, SessionConfig};
use crate::shutdown::ShutdownToken;
use crate::transport::UaTransport;
use crate::types::NodeIdentity;

// =============================================================================
// PublisherSettings
// =============================================================================

/// Engine-wide settings: per-session tunables plus the interval defaults
/// applied when an add request or config entry leaves them out.
#[derive(Debug, Clone)]
pub struct PublisherSettings {
    /// Tunables handed to every session.
    pub session: SessionConfig,

    /// Sampling interval applied when unspecified.
    pub default_sampling_interval_ms: u64,

    /// Publishing interval applied when unspecified.
    pub default_publishing_interval_ms: u64,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            default_sampling_interval_ms: DEFAULT_SAMPLING_INTERVAL_MS,
            default_publishing_interval_ms: DEFAULT_PUBLISHING_INTERVAL_MS,
        }
    }
}

// =============================================================================
// SessionRegistry
// =============================================================================

struct RegisteredSession<T: UaTransport> {
    /// Normalized endpoint key.
    key: String,
    session: Arc<Session<T>>,
}

/// The ordered set of sessions plus the reconciliation scheduler and the
/// configuration persister.
pub struct SessionRegistry<T: UaTransport> {
    transport: Arc<T>,
    sink: Arc<dyn TelemetrySink>,
    settings: PublisherSettings,
    sessions: Mutex<Vec<RegisteredSession<T>>>,
    config: Mutex<ConfigFile>,
    kick: Arc<Notify>,
    shutdown: ShutdownToken,
}

impl<T: UaTransport> SessionRegistry<T> {
    /// Creates an empty registry.
    pub fn new(
        transport: Arc<T>,
        sink: Arc<dyn TelemetrySink>,
        settings: PublisherSettings,
        config: ConfigFile,
        shutdown: ShutdownToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            sink,
            settings,
            sessions: Mutex::new(Vec::new()),
            config: Mutex::new(config),
            kick: Arc::new(Notify::new()),
            shutdown,
        })
    }

    /// Builds sessions, subscriptions, and items from the published-nodes
    /// file. A read or parse failure here is fatal for startup.
    ///
    /// Returns the number of nodes loaded.
    pub async fn bootstrap(&self) -> UaResult<usize> {
        let entries = {
            let config = self.config.lock().await;
            config.read_entries()?
        };

        let mut loaded = 0usize;
        for entry in &entries {
            let session = self.ensure_session(&entry.endpoint_url).await;
            for (node_str, sampling_ms, publishing_ms) in entry.nodes() {
                let identity: NodeIdentity = node_str.parse().map_err(|e| {
                    error!(
                        endpoint = %entry.endpoint_url,
                        node = %node_str,
                        error = %e,
                        "Rejecting published-nodes file"
                    );
                    e
                })?;
                session
                    .add_node_from_config(identity, publishing_ms, sampling_ms)
                    .await?;
                loaded += 1;
            }
        }

        info!(
            sessions = self.session_count().await,
            nodes = loaded,
            "Published-nodes configuration applied"
        );
        Ok(loaded)
    }

    // =========================================================================
    // Session lookup
    // =========================================================================

    /// Finds the session for an endpoint, creating one when missing.
    pub async fn ensure_session(&self, endpoint: &str) -> Arc<Session<T>> {
        let key = normalize_endpoint(endpoint);
        let mut sessions = self.sessions.lock().await;
        if let Some(found) = sessions.iter().find(|s| s.key == key) {
            return Arc::clone(&found.session);
        }

        let session = Session::new(
            endpoint.trim().to_string(),
            self.settings.session.clone(),
            Arc::clone(&self.transport),
            Arc::clone(&self.sink),
            Arc::clone(&self.kick),
            self.shutdown.clone(),
        );
        info!(endpoint = %session.endpoint_url(), "Session registered");
        sessions.push(RegisteredSession {
            key,
            session: Arc::clone(&session),
        });
        session
    }

    /// Finds the session for an endpoint without creating one.
    pub async fn session(&self, endpoint: &str) -> Option<Arc<Session<T>>> {
        let key = normalize_endpoint(endpoint);
        self.sessions
            .lock()
            .await
            .iter()
            .find(|s| s.key == key)
            .map(|s| Arc::clone(&s.session))
    }

    /// Number of registered sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    fn sessions_snapshot_blocking(sessions: &[RegisteredSession<T>]) -> Vec<Arc<Session<T>>> {
        sessions.iter().map(|s| Arc::clone(&s.session)).collect()
    }

    async fn sessions_snapshot(&self) -> Vec<Arc<Session<T>>> {
        let sessions = self.sessions.lock().await;
        Self::sessions_snapshot_blocking(&sessions)
    }

    // =========================================================================
    // Mutators
    // =========================================================================

    /// Adds a node for monitoring on an endpoint, creating the session
    /// and interval subscription as needed. Returns `true` when a new
    /// item was created (idempotent otherwise).
    pub async fn add_node(
        &self,
        endpoint: &str,
        identity: NodeIdentity,
        publishing_interval_ms: Option<u64>,
        sampling_interval_ms: Option<u64>,
    ) -> UaResult<bool> {
        if self.shutdown.is_shutdown_requested() {
            return Ok(false);
        }
        let session = self.ensure_session(endpoint).await;
        session
            .add_node(
                identity,
                publishing_interval_ms.unwrap_or(self.settings.default_publishing_interval_ms),
                sampling_interval_ms.unwrap_or(self.settings.default_sampling_interval_ms),
            )
            .await
    }

    /// Requests removal of a node, on one endpoint or everywhere.
    /// Returns the number of items tagged.
    pub async fn remove_node(
        &self,
        endpoint: Option<&str>,
        identity: &NodeIdentity,
    ) -> UaResult<usize> {
        if self.shutdown.is_shutdown_requested() {
            return Ok(0);
        }

        let targets = match endpoint {
            Some(endpoint) => self.session(endpoint).await.into_iter().collect(),
            None => self.sessions_snapshot().await,
        };

        let mut tagged = 0;
        for session in targets {
            tagged += session.request_node_removal(identity).await?;
        }
        Ok(tagged)
    }

    /// Returns `true` if the node is published in the endpoint's session.
    pub async fn is_node_published(&self, endpoint: &str, identity: &NodeIdentity) -> bool {
        match self.session(endpoint).await {
            Some(session) => session.is_node_published(identity).await,
            None => false,
        }
    }

    /// Returns `true` if the node is published in any session.
    pub async fn is_node_published_anywhere(&self, identity: &NodeIdentity) -> bool {
        for session in self.sessions_snapshot().await {
            if session.is_node_published(identity).await {
                return true;
            }
        }
        false
    }

    // =========================================================================
    // Reconciliation driver
    // =========================================================================

    /// Runs one full reconciliation tick over all sessions, collects
    /// empty sessions, and rewrites the published-nodes file when any
    /// phase reported a configuration change.
    pub async fn reconcile_once(&self) {
        let sessions = self.sessions_snapshot().await;

        let mut dirty = false;
        for session in sessions {
            if self.shutdown.is_shutdown_requested() {
                return;
            }
            dirty |= session.reconcile().await;
        }

        dirty |= self.gc_sessions().await;

        if dirty {
            self.persist().await;
        }
    }

    /// Drops sessions whose subscription list is empty. The session is
    /// removed from the registry before it is shut down, so no caller
    /// can reach a dead session.
    async fn gc_sessions(&self) -> bool {
        let doomed = {
            let mut sessions = self.sessions.lock().await;
            let mut kept = Vec::with_capacity(sessions.len());
            let mut doomed = Vec::new();
            for registered in sessions.drain(..) {
                if registered.session.is_empty().await {
                    doomed.push(registered.session);
                } else {
                    kept.push(registered);
                }
            }
            *sessions = kept;
            doomed
        };

        if doomed.is_empty() {
            return false;
        }
        for session in &doomed {
            info!(endpoint = %session.endpoint_url(), "Session has no subscriptions; shutting down");
            session.shutdown().await;
        }
        true
    }

    /// Drives reconciliation until shutdown: a periodic tick plus the
    /// kick mutators fire. One tick fully completes before the next
    /// begins.
    pub async fn run(&self, interval: Duration) {
        info!(interval_secs = interval.as_secs(), "Reconciliation driver started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.kick.notified() => {}
            }
            if self.shutdown.is_shutdown_requested() {
                break;
            }
            self.reconcile_once().await;
        }
        info!("Reconciliation driver stopped");
    }

    /// Wakes the driver ahead of its next periodic tick.
    pub fn kick(&self) {
        self.kick.notify_one();
    }

    /// Shuts down every session. The registry is drained first.
    pub async fn shutdown_all(&self) {
        let sessions = {
            let mut guard = self.sessions.lock().await;
            guard
                .drain(..)
                .map(|r| r.session)
                .collect::<Vec<_>>()
        };
        for session in sessions {
            session.shutdown().await;
        }
        info!("All sessions shut down");
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Snapshots the live state as published-nodes entries.
    ///
    /// Each item keeps its current identity form; `force_node_form`
    /// requests the concrete `ns=` form instead, resolved through each
    /// session's namespace table.
    pub async fn snapshot_entries(&self, force_node_form: bool) -> Vec<PublishedNodesEntry> {
        let sessions = self.sessions_snapshot().await;

        let mut entries = Vec::new();
        for session in sessions {
            let nodes = session.published_nodes(force_node_form).await;
            if nodes.is_empty() {
                continue;
            }
            let opc_nodes = nodes
                .into_iter()
                .map(|n| {
                    OpcNodeEntry::new(
                        n.node,
                        (n.sampling_interval_ms != self.settings.default_sampling_interval_ms)
                            .then_some(n.sampling_interval_ms),
                        (n.publishing_interval_ms
                            != self.settings.default_publishing_interval_ms)
                            .then_some(n.publishing_interval_ms),
                    )
                })
                .collect();
            entries.push(PublishedNodesEntry::with_nodes(
                session.endpoint_url(),
                opc_nodes,
            ));
        }
        entries
    }

    /// Rewrites the published-nodes file from the live state. Write
    /// failures are logged and swallowed; the in-memory state stays
    /// authoritative.
    pub async fn persist(&self) {
        // Snapshot completes (registry, then session locks) before the
        // config mutex is taken for the write; no lock is ever nested
        // inside the config mutex.
        let entries = self.snapshot_entries(false).await;
        let config = self.config.lock().await;
        debug!(entries = entries.len(), "Persisting published-nodes file");
        config.write_entries_best_effort(&entries);
    }
}

/// Endpoint URLs compare case-insensitively on the absolute URI.
fn normalize_endpoint(endpoint: &str) -> String {
    match Url::parse(endpoint.trim()) {
        Ok(url) => url.as_str().trim_end_matches('/').to_ascii_lowercase(),
        Err(_) => endpoint.trim().trim_end_matches('/').to_ascii_lowercase(),
    }
}

// =============================================================================
// Tests
// =============================================================================
