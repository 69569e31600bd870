// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Per-endpoint session: the reconciliation engine.
//!
//! A session owns the connection to one endpoint and the subscriptions
//! on it. The periodic reconciler drives [`Session::reconcile`], which
//! runs its phases in a fixed order: connect, monitor pending items,
//! remove tagged items, collect empty subscriptions. External callers
//! mutate desired state through [`Session::add_node`] /
//! [`Session::request_node_removal`] and wake the reconciler through the
//! shared kick instead of spawning work themselves.
//!
//! One `tokio::sync::Mutex` guards the whole session. The single
//! deliberate exception: the mutex is released across the blocking
//! transport connect call so mutators are not stalled for a full connect
//! timeout, and re-acquired to finalize state either way.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use siphon_egress::TelemetrySink;

use crate::envelope::EnvelopeContext;
use crate::error::{UaError, UaResult};
use crate::monitored_item::{MonitorState, MonitoredItem};
use crate::shutdown::ShutdownToken;
use crate::subscription::Subscription;
use crate::transport::{
    ConnectOptions, ItemCreateRequest, ServerHandle, TransportEvent, UaTransport,
};
use crate::types::{NamespaceTable, NodeIdentity, StatusCode};

/// Cap applied to the linear connect backoff multiplier.
pub const CONNECT_BACKOFF_MAX: u32 = 5;

// =============================================================================
// SessionState
// =============================================================================

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    /// No server connection.
    #[default]
    Disconnected,

    /// Connect in progress.
    Connecting,

    /// Live server connection.
    Connected,

    /// Teardown in progress.
    ShuttingDown,

    /// Terminal: no operation on this session is legal anymore.
    Shutdown,
}

impl SessionState {
    /// Returns `true` while the session has a live server handle.
    #[inline]
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Returns `true` once teardown has started.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Shutdown)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::ShuttingDown => "ShuttingDown",
            Self::Shutdown => "Shutdown",
        };
        write!(f, "{}", name)
    }
}

// =============================================================================
// SessionConfig
// =============================================================================

/// Tunables for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Requested session timeout; also the base of the connect backoff.
    pub session_timeout_ms: u64,

    /// Keep-alive cadence requested from the transport.
    pub keep_alive_interval: Duration,

    /// Consecutive bad keep-alives that trigger a disconnect.
    pub keep_alive_disconnect_threshold: u32,

    /// Whether to read each node's DisplayName at monitor time.
    pub fetch_display_name: bool,

    /// Client application name presented to servers.
    pub application_name: String,

    /// Optional shopfloor domain appended to the envelope ApplicationUri.
    pub shopfloor_domain: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_timeout_ms: 10_000,
            keep_alive_interval: Duration::from_secs(2),
            keep_alive_disconnect_threshold: 5,
            fetch_display_name: false,
            application_name: "siphon".to_string(),
            shopfloor_domain: None,
        }
    }
}

// =============================================================================
// Session
// =============================================================================

/// One long-lived client session against one endpoint.
pub struct Session<T: UaTransport> {
    endpoint_url: String,
    config: SessionConfig,
    transport: Arc<T>,
    sink: Arc<dyn TelemetrySink>,
    kick: Arc<Notify>,
    shutdown: ShutdownToken,
    /// Self-reference handed to the event pump.
    me: Weak<Session<T>>,
    inner: Mutex<SessionInner>,
}

struct SessionInner {
    state: SessionState,
    server: Option<ServerHandle>,
    application_uri: String,
    namespace_table: NamespaceTable,
    min_supported_sampling_interval_ms: Option<u64>,
    subscriptions: BTreeMap<u64, Subscription>,
    unsuccessful_connects: u32,
    missed_keep_alives: u32,
    next_client_handle: u32,
    pump: Option<JoinHandle<()>>,
}

impl SessionInner {
    fn is_node_published(&self, query: &NodeIdentity) -> bool {
        self.subscriptions
            .values()
            .any(|sub| sub.find_item(query, &self.namespace_table).is_some())
    }
}

impl<T: UaTransport> Session<T> {
    /// Creates a disconnected session.
    pub fn new(
        endpoint_url: impl Into<String>,
        config: SessionConfig,
        transport: Arc<T>,
        sink: Arc<dyn TelemetrySink>,
        kick: Arc<Notify>,
        shutdown: ShutdownToken,
    ) -> Arc<Self> {
        let endpoint_url: String = endpoint_url.into();
        Arc::new_cyclic(|me| Self {
            endpoint_url,
            config,
            transport,
            sink,
            kick,
            shutdown,
            me: me.clone(),
            inner: Mutex::new(SessionInner {
                state: SessionState::Disconnected,
                server: None,
                application_uri: String::new(),
                namespace_table: NamespaceTable::new(),
                min_supported_sampling_interval_ms: None,
                subscriptions: BTreeMap::new(),
                unsuccessful_connects: 0,
                missed_keep_alives: 0,
                next_client_handle: 1,
                pump: None,
            }),
        })
    }

    /// The endpoint this session serves.
    pub fn endpoint_url(&self) -> &str {
        &self.endpoint_url
    }

    /// Current connection state.
    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    /// Returns `true` when the session holds no subscriptions and is
    /// eligible for shutdown by the registry.
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.subscriptions.is_empty()
    }

    /// Number of subscriptions.
    pub async fn subscription_count(&self) -> usize {
        self.inner.lock().await.subscriptions.len()
    }

    /// Number of consecutive failed connect attempts.
    pub async fn unsuccessful_connects(&self) -> u32 {
        self.inner.lock().await.unsuccessful_connects
    }

    /// Point-in-time view of every item's identity and state, for
    /// diagnostics.
    pub async fn item_states(&self) -> Vec<(NodeIdentity, MonitorState)> {
        let inner = self.inner.lock().await;
        inner
            .subscriptions
            .values()
            .flat_map(|sub| {
                sub.items
                    .iter()
                    .map(|i| (i.identity.clone(), i.state))
            })
            .collect()
    }

    /// Resolves a namespace index to its URI from the session's table.
    pub async fn namespace_uri(&self, index: u16) -> Option<String> {
        self.inner
            .lock()
            .await
            .namespace_table
            .uri(index)
            .map(str::to_string)
    }

    /// Resolves a namespace URI to its index in the session's table.
    pub async fn namespace_index(&self, uri: &str) -> Option<u16> {
        self.inner.lock().await.namespace_table.index_of(uri)
    }

    // =========================================================================
    // Mutators
    // =========================================================================

    /// Adds a node for monitoring (runtime path).
    ///
    /// Idempotent: when the node is already published in this session
    /// nothing changes. Concrete identities are queued for upgrade to
    /// the portable form on the next pass. Returns `true` when a new
    /// item was created.
    pub async fn add_node(
        &self,
        identity: NodeIdentity,
        publishing_interval_ms: u64,
        sampling_interval_ms: u64,
    ) -> UaResult<bool> {
        self.add_node_inner(identity, publishing_interval_ms, sampling_interval_ms, true)
            .await
    }

    /// Adds a node from the startup configuration.
    ///
    /// Unlike the runtime path, concrete identities stay in concrete
    /// form: their namespace index came from the file and is already
    /// authoritative. Portable identities still need resolution once the
    /// namespace table is known.
    pub async fn add_node_from_config(
        &self,
        identity: NodeIdentity,
        publishing_interval_ms: u64,
        sampling_interval_ms: u64,
    ) -> UaResult<bool> {
        self.add_node_inner(identity, publishing_interval_ms, sampling_interval_ms, false)
            .await
    }

    async fn add_node_inner(
        &self,
        identity: NodeIdentity,
        publishing_interval_ms: u64,
        sampling_interval_ms: u64,
        upgrade_concrete_form: bool,
    ) -> UaResult<bool> {
        if self.shutdown.is_shutdown_requested() {
            debug!(endpoint = %self.endpoint_url, "Shutdown requested; add ignored");
            return Ok(false);
        }

        let mut inner = self.inner.lock().await;
        if inner.state.is_terminal() {
            return Ok(false);
        }
        if inner.is_node_published(&identity) {
            debug!(endpoint = %self.endpoint_url, node = %identity, "Node already published");
            return Ok(false);
        }

        let request_namespace_update = match &identity {
            NodeIdentity::Node(_) => upgrade_concrete_form,
            NodeIdentity::Expanded(e) => e.namespace_index.is_none(),
        };

        let client_handle = inner.next_client_handle;
        inner.next_client_handle += 1;

        let item = MonitoredItem::new(
            identity.clone(),
            sampling_interval_ms,
            client_handle,
            request_namespace_update,
        );
        inner
            .subscriptions
            .entry(publishing_interval_ms)
            .or_insert_with(|| Subscription::new(publishing_interval_ms))
            .items
            .push(item);
        drop(inner);

        info!(
            endpoint = %self.endpoint_url,
            node = %identity,
            publishing_interval_ms,
            sampling_interval_ms,
            "Node queued for monitoring"
        );
        self.kick.notify_one();
        Ok(true)
    }

    /// Tags every item matching the query for removal and wakes the
    /// reconciler. Returns the number of tagged items.
    pub async fn request_node_removal(&self, query: &NodeIdentity) -> UaResult<usize> {
        if self.shutdown.is_shutdown_requested() {
            debug!(endpoint = %self.endpoint_url, "Shutdown requested; removal ignored");
            return Ok(0);
        }

        let mut inner = self.inner.lock().await;
        if inner.state.is_terminal() {
            return Ok(0);
        }

        let SessionInner {
            subscriptions,
            namespace_table,
            ..
        } = &mut *inner;

        let mut tagged = 0;
        for sub in subscriptions.values_mut() {
            tagged += sub.request_removal(query, namespace_table);
        }
        drop(inner);

        if tagged > 0 {
            info!(endpoint = %self.endpoint_url, node = %query, tagged, "Node removal requested");
            self.kick.notify_one();
        }
        Ok(tagged)
    }

    /// Returns `true` if the queried node is published in this session.
    pub async fn is_node_published(&self, query: &NodeIdentity) -> bool {
        self.inner.lock().await.is_node_published(query)
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Runs one reconciliation pass: connect, monitor pending items,
    /// remove tagged items, collect empty subscriptions.
    ///
    /// Returns `true` when the pass changed state that the configuration
    /// file must reflect.
    pub async fn reconcile(&self) -> bool {
        self.connect_phase().await;

        let mut dirty = false;
        dirty |= self.monitor_phase().await;
        dirty |= self.stop_monitoring_phase().await;
        self.gc_subscriptions_phase().await;
        dirty
    }

    /// Connect phase: only acts when `Disconnected`.
    async fn connect_phase(&self) {
        let (timeout, attempt) = {
            let mut inner = self.inner.lock().await;
            if inner.state != SessionState::Disconnected {
                return;
            }
            inner.state = SessionState::Connecting;
            (
                self.connect_timeout(inner.unsuccessful_connects),
                inner.unsuccessful_connects + 1,
            )
        };
        // The session mutex is intentionally NOT held across the connect
        // call; mutators stay responsive during the (possibly long)
        // timeout.

        debug!(
            endpoint = %self.endpoint_url,
            attempt,
            timeout_ms = timeout.as_millis() as u64,
            "Connecting"
        );

        let options = ConnectOptions {
            timeout,
            session_timeout_ms: self.config.session_timeout_ms,
            keep_alive_interval: self.config.keep_alive_interval,
            application_name: self.config.application_name.clone(),
        };
        let result = self.transport.connect(&self.endpoint_url, options).await;

        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::Connecting {
            // Shutdown raced the connect; release whatever we acquired.
            if let Ok(connected) = result {
                let _ = self.transport.close_session(connected.handle).await;
            }
            return;
        }

        let connected = match result {
            Ok(connected) => connected,
            Err(e) => {
                inner.unsuccessful_connects += 1;
                inner.state = SessionState::Disconnected;
                warn!(
                    endpoint = %self.endpoint_url,
                    attempt,
                    error = %e,
                    "Connect failed"
                );
                return;
            }
        };

        let server = connected.handle;

        // The namespace table is populated exactly once per
        // Connecting -> Connected transition and treated as stable until
        // the session reconnects. Failing this read fails the connect.
        let namespaces = match self.transport.read_namespace_array(server).await {
            Ok(uris) => uris,
            Err(e) => {
                warn!(
                    endpoint = %self.endpoint_url,
                    error = %e,
                    "Failed to read namespace array; dropping fresh session"
                );
                let _ = self.transport.close_session(server).await;
                inner.unsuccessful_connects += 1;
                inner.state = SessionState::Disconnected;
                return;
            }
        };

        let min_sampling = match self
            .transport
            .read_min_supported_sampling_interval(server)
            .await
        {
            Ok(v) => v,
            Err(e) => {
                debug!(endpoint = %self.endpoint_url, error = %e, "MinSupportedSampleRate unavailable");
                None
            }
        };

        inner.namespace_table.populate(namespaces);
        inner.min_supported_sampling_interval_ms = min_sampling;
        inner.application_uri = connected.application_uri;
        inner.server = Some(server);
        inner.unsuccessful_connects = 0;
        inner.missed_keep_alives = 0;
        if let Some(old) = inner.pump.take() {
            old.abort();
        }
        inner.pump = Some(self.spawn_pump(connected.events));
        inner.state = SessionState::Connected;

        info!(
            endpoint = %self.endpoint_url,
            application_uri = %inner.application_uri,
            namespaces = inner.namespace_table.len(),
            "Session connected"
        );
    }

    /// Monitor phase: creates server-side subscriptions and items for
    /// everything pending. Returns `true` when an item reached
    /// `Monitored` (configuration-relevant: revised intervals changed).
    async fn monitor_phase(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::Connected {
            return false;
        }
        let server = match inner.server {
            Some(s) => s,
            None => return false,
        };

        let mut dirty = false;
        let mut session_lost = false;

        let intervals: Vec<u64> = inner.subscriptions.keys().copied().collect();
        'subscriptions: for interval in intervals {
            // Create the server-side subscription on demand; a failure
            // here skips the group for this pass and retries next tick.
            let needs_create = inner
                .subscriptions
                .get(&interval)
                .is_some_and(|s| s.server_handle.is_none() && !s.items.is_empty());
            if needs_create {
                match self.transport.create_subscription(server, interval).await {
                    Ok(created) => {
                        info!(
                            endpoint = %self.endpoint_url,
                            publishing_interval_ms = interval,
                            subscription_id = created.subscription_id,
                            revised_ms = created.revised_publishing_interval_ms,
                            "Subscription created"
                        );
                        if let Some(sub) = inner.subscriptions.get_mut(&interval) {
                            sub.mark_created(
                                created.subscription_id,
                                created.revised_publishing_interval_ms,
                            );
                        }
                    }
                    Err(e) => {
                        warn!(
                            endpoint = %self.endpoint_url,
                            publishing_interval_ms = interval,
                            error = %e,
                            "Subscription create failed; retrying next pass"
                        );
                        continue 'subscriptions;
                    }
                }
            }

            let Some(sub_handle) = inner
                .subscriptions
                .get(&interval)
                .and_then(|s| s.server_handle)
            else {
                continue;
            };

            let min_sampling = inner.min_supported_sampling_interval_ms;
            let item_count = inner
                .subscriptions
                .get(&interval)
                .map_or(0, |s| s.items.len());

            for idx in 0..item_count {
                // Split borrows: items are mutated while the namespace
                // table is only read.
                let SessionInner {
                    subscriptions,
                    namespace_table,
                    ..
                } = &mut *inner;
                let Some(item) = subscriptions
                    .get_mut(&interval)
                    .and_then(|s| s.items.get_mut(idx))
                else {
                    break;
                };

                if !item.state.is_pending_monitor() {
                    continue;
                }

                if item.state == MonitorState::NamespaceUpdateRequested {
                    if let Err(e) = item.resolve_identity(namespace_table) {
                        info!(
                            endpoint = %self.endpoint_url,
                            node = %item.identity,
                            error = %e,
                            "Namespace reconciliation pending; skipping node this cycle"
                        );
                        continue;
                    }
                }

                let node = match item.effective_node_id() {
                    Ok(node) => node,
                    Err(e) => {
                        warn!(
                            endpoint = %self.endpoint_url,
                            node = %item.identity,
                            error = %e,
                            "No effective node id; skipping node this cycle"
                        );
                        continue;
                    }
                };

                let mut sampling = item.requested_sampling_interval_ms;
                if let Some(min) = min_sampling {
                    if sampling < min {
                        debug!(
                            endpoint = %self.endpoint_url,
                            node = %node,
                            requested_ms = sampling,
                            min_ms = min,
                            "Sampling interval clamped to server minimum"
                        );
                        sampling = min;
                    }
                }

                let display_name = if self.config.fetch_display_name {
                    match self.transport.read_display_name(server, &node).await {
                        Ok(name) if !name.is_empty() => name,
                        Ok(_) => node.to_string(),
                        Err(e) => {
                            debug!(
                                endpoint = %self.endpoint_url,
                                node = %node,
                                error = %e,
                                "DisplayName read failed; using node id"
                            );
                            node.to_string()
                        }
                    }
                } else {
                    node.to_string()
                };

                let request = ItemCreateRequest {
                    node: node.clone(),
                    client_handle: item.client_handle,
                    sampling_interval_ms: sampling,
                    queue_size: item.queue_size,
                    discard_oldest: item.discard_oldest,
                    monitoring_mode: item.monitoring_mode,
                    attribute: item.attribute,
                };

                let created = self
                    .transport
                    .create_monitored_item(server, sub_handle, request)
                    .await;
                match created {
                    Ok(created) => {
                        item.display_name = display_name;
                        item.mark_monitored(
                            created.item_handle,
                            created.revised_sampling_interval_ms,
                        );
                        dirty = true;
                        info!(
                            endpoint = %self.endpoint_url,
                            node = %item.identity,
                            revised_sampling_ms = created.revised_sampling_interval_ms,
                            "Node monitored"
                        );
                        if let Err(e) = self
                            .transport
                            .set_publishing_mode(server, &[sub_handle], true)
                            .await
                        {
                            warn!(
                                endpoint = %self.endpoint_url,
                                subscription_id = sub_handle,
                                error = %e,
                                "Failed to enable publishing"
                            );
                        }
                    }
                    Err(e) => match e.service_status() {
                        Some(StatusCode::BAD_SESSION_ID_INVALID) => {
                            warn!(
                                endpoint = %self.endpoint_url,
                                "Session invalidated by server; disconnecting"
                            );
                            session_lost = true;
                            break 'subscriptions;
                        }
                        Some(
                            status @ (StatusCode::BAD_NODE_ID_INVALID
                            | StatusCode::BAD_NODE_ID_UNKNOWN),
                        ) => {
                            error!(
                                endpoint = %self.endpoint_url,
                                node = %item.identity,
                                status = %status,
                                "Configured node rejected by server; not retried until re-added"
                            );
                            item.state = MonitorState::PermanentlyFailed;
                        }
                        _ => {
                            if matches!(
                                e,
                                UaError::Connection(
                                    crate::error::ConnectionError::NotConnected
                                )
                            ) {
                                warn!(endpoint = %self.endpoint_url, "Session lost mid-pass");
                                session_lost = true;
                                break 'subscriptions;
                            }
                            warn!(
                                endpoint = %self.endpoint_url,
                                node = %item.identity,
                                error = %e,
                                "Monitored item create failed; will retry"
                            );
                        }
                    },
                }
            }
        }

        if session_lost {
            self.internal_disconnect(&mut inner).await;
        }
        dirty
    }

    /// Stop phase: drops items tagged for removal, server-side first
    /// (best effort), then in memory. Returns `true` when anything was
    /// removed.
    async fn stop_monitoring_phase(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::Connected {
            return false;
        }
        let server = match inner.server {
            Some(s) => s,
            None => return false,
        };

        let mut removed_any = false;
        let intervals: Vec<u64> = inner.subscriptions.keys().copied().collect();
        for interval in intervals {
            let Some(sub) = inner.subscriptions.get_mut(&interval) else {
                continue;
            };
            let removed = sub.take_removal_requested();
            if removed.is_empty() {
                continue;
            }
            removed_any = true;

            let handles: Vec<u32> = removed.iter().filter_map(|i| i.server_handle).collect();
            if let Some(sub_handle) = sub.server_handle {
                if !handles.is_empty() {
                    // Best effort: the items may never have been created
                    // on the server in the first place.
                    if let Err(e) = self
                        .transport
                        .remove_monitored_items(server, sub_handle, &handles)
                        .await
                    {
                        debug!(
                            endpoint = %self.endpoint_url,
                            subscription_id = sub_handle,
                            error = %e,
                            "Monitored item removal failed; ignored"
                        );
                    }
                }
            }
            info!(
                endpoint = %self.endpoint_url,
                publishing_interval_ms = interval,
                removed = removed.len(),
                "Nodes removed from monitoring"
            );
        }
        removed_any
    }

    /// Collects subscriptions whose item list became empty.
    async fn gc_subscriptions_phase(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::Connected {
            return;
        }
        let server = match inner.server {
            Some(s) => s,
            None => return,
        };

        let empty: Vec<u64> = inner
            .subscriptions
            .iter()
            .filter(|(_, s)| s.is_empty())
            .map(|(k, _)| *k)
            .collect();
        if empty.is_empty() {
            return;
        }

        let handles: Vec<u32> = empty
            .iter()
            .filter_map(|k| inner.subscriptions.get(k).and_then(|s| s.server_handle))
            .collect();
        if !handles.is_empty() {
            if let Err(e) = self.transport.delete_subscriptions(server, &handles).await {
                debug!(
                    endpoint = %self.endpoint_url,
                    error = %e,
                    "Subscription delete failed; ignored"
                );
            }
        }
        for key in &empty {
            inner.subscriptions.remove(key);
        }
        info!(
            endpoint = %self.endpoint_url,
            removed = empty.len(),
            "Unused subscriptions removed"
        );
    }

    fn connect_timeout(&self, unsuccessful_connects: u32) -> Duration {
        let factor = (unsuccessful_connects + 1).min(CONNECT_BACKOFF_MAX) as u64;
        Duration::from_millis(self.config.session_timeout_ms * factor)
    }

    // =========================================================================
    // Event pump
    // =========================================================================

    fn spawn_pump(
        &self,
        mut events: tokio::sync::mpsc::UnboundedReceiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let session = self.me.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(session) = session.upgrade() else {
                    break;
                };
                match event {
                    TransportEvent::KeepAlive(status) => {
                        if session.handle_keep_alive(status).await {
                            // Threshold crossed: detach from the stream.
                            break;
                        }
                    }
                    TransportEvent::DataChange {
                        subscription_id,
                        client_handle,
                        value,
                    } => {
                        session
                            .handle_notification(subscription_id, client_handle, value)
                            .await;
                    }
                }
            }
        })
    }

    /// Keep-alive accounting. Returns `true` when the handler detaches
    /// after triggering a disconnect.
    async fn handle_keep_alive(&self, status: StatusCode) -> bool {
        if self.shutdown.is_shutdown_requested() {
            return false;
        }

        let mut inner = self.inner.lock().await;
        if status.is_good() {
            inner.missed_keep_alives = 0;
            return false;
        }

        // Only count while connected; a session mid-connect or already
        // down produces noise, not signal.
        if inner.state != SessionState::Connected {
            return false;
        }

        inner.missed_keep_alives += 1;
        warn!(
            endpoint = %self.endpoint_url,
            status = %status,
            missed = inner.missed_keep_alives,
            threshold = self.config.keep_alive_disconnect_threshold,
            "Keep-alive missed"
        );

        if inner.missed_keep_alives >= self.config.keep_alive_disconnect_threshold {
            error!(
                endpoint = %self.endpoint_url,
                "Keep-alive threshold reached; disconnecting session"
            );
            self.internal_disconnect(&mut inner).await;
            self.kick.notify_one();
            return true;
        }
        false
    }

    /// Routes one value-change notification to the egress queue.
    async fn handle_notification(
        &self,
        subscription_id: u32,
        client_handle: u32,
        value: crate::types::DataValue,
    ) {
        let inner = self.inner.lock().await;

        let Some(item) = inner
            .subscriptions
            .values()
            .find(|s| s.server_handle == Some(subscription_id))
            .and_then(|s| s.item_by_client_handle(client_handle))
        else {
            // Late notification for an item that is already gone.
            debug!(
                endpoint = %self.endpoint_url,
                subscription_id,
                client_handle,
                "Notification for unknown item dropped"
            );
            return;
        };

        let ctx = EnvelopeContext {
            application_uri: inner.application_uri.clone(),
            shopfloor_domain: self.config.shopfloor_domain.clone(),
        };
        if let Some(payload) = item.encode_notification(&ctx, &value) {
            self.sink.enqueue(payload);
        }
    }

    /// Tears down the server side of the session.
    ///
    /// Runs under the already-held session mutex. The transport close is
    /// best effort; the event pump is left to wind down on its own when
    /// the transport drops the event stream.
    async fn internal_disconnect(&self, inner: &mut SessionInner) {
        if let Some(server) = inner.server.take() {
            if let Err(e) = self.transport.close_session(server).await {
                debug!(endpoint = %self.endpoint_url, error = %e, "Session close failed; ignored");
            }
        }
        inner.missed_keep_alives = 0;
        inner.state = SessionState::Disconnected;
        for sub in inner.subscriptions.values_mut() {
            sub.reset_after_disconnect();
        }
        info!(endpoint = %self.endpoint_url, "Session disconnected");
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Terminal teardown. Idempotent; after it returns no operation on
    /// this session is legal (the registry removes the session first).
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Shutdown {
            return;
        }
        inner.state = SessionState::ShuttingDown;

        if let Some(server) = inner.server.take() {
            for sub in inner.subscriptions.values() {
                let Some(sub_handle) = sub.server_handle else {
                    continue;
                };
                let handles = sub.monitored_item_handles();
                if handles.is_empty() {
                    continue;
                }
                if let Err(e) = self
                    .transport
                    .remove_monitored_items(server, sub_handle, &handles)
                    .await
                {
                    debug!(endpoint = %self.endpoint_url, error = %e, "Item removal failed during shutdown; ignored");
                }
            }

            let sub_handles: Vec<u32> = inner
                .subscriptions
                .values()
                .filter_map(|s| s.server_handle)
                .collect();
            if !sub_handles.is_empty() {
                if let Err(e) = self
                    .transport
                    .delete_subscriptions(server, &sub_handles)
                    .await
                {
                    debug!(endpoint = %self.endpoint_url, error = %e, "Subscription delete failed during shutdown; ignored");
                }
            }

            if let Err(e) = self.transport.close_session(server).await {
                debug!(endpoint = %self.endpoint_url, error = %e, "Session close failed during shutdown; ignored");
            }
        }

        if let Some(pump) = inner.pump.take() {
            pump.abort();
        }
        for sub in inner.subscriptions.values_mut() {
            sub.server_handle = None;
            sub.revised_publishing_interval_ms = None;
            for item in &mut sub.items {
                item.server_handle = None;
                item.revised_sampling_interval_ms = None;
                item.state = MonitorState::Unmonitored;
            }
        }
        inner.state = SessionState::Shutdown;
        info!(endpoint = %self.endpoint_url, "Session shut down");
    }

    // =========================================================================
    // Persistence snapshot
    // =========================================================================

    /// Emits the session's live node set for the configuration file.
    ///
    /// Items tagged for removal are skipped. Each item keeps its current
    /// identity form unless `force_node_form` requests the concrete
    /// form, which is then produced through the namespace table where
    /// resolvable (and left as-is where not).
    pub async fn published_nodes(&self, force_node_form: bool) -> Vec<PublishedNode> {
        let inner = self.inner.lock().await;
        let mut nodes = Vec::new();
        for sub in inner.subscriptions.values() {
            for item in &sub.items {
                if item.state == MonitorState::RemovalRequested {
                    continue;
                }
                let node = if force_node_form {
                    Self::forced_node_form(&item.identity, &inner.namespace_table)
                } else {
                    item.identity.to_string()
                };
                nodes.push(PublishedNode {
                    node,
                    sampling_interval_ms: item.requested_sampling_interval_ms,
                    publishing_interval_ms: sub.requested_publishing_interval_ms,
                });
            }
        }
        nodes
    }

    fn forced_node_form(identity: &NodeIdentity, table: &NamespaceTable) -> String {
        match identity {
            NodeIdentity::Node(n) => n.to_string(),
            NodeIdentity::Expanded(e) => {
                let index = e.namespace_index.or_else(|| table.index_of(&e.namespace_uri));
                match index {
                    Some(index) => crate::types::UaNodeId {
                        namespace_index: index,
                        identifier: e.identifier.clone(),
                    }
                    .to_string(),
                    None => identity.to_string(),
                }
            }
        }
    }
}

// =============================================================================
// PublishedNode
// =============================================================================

/// One row of the persistence snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedNode {
    /// Identity string in its emission form.
    pub node: String,

    /// Requested sampling interval.
    pub sampling_interval_ms: u64,

    /// Requested publishing interval of the owning subscription.
    pub publishing_interval_ms: u64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_state_display() {
        assert_eq!(SessionState::Disconnected.to_string(), "Disconnected");
        assert_eq!(SessionState::Connected.to_string(), "Connected");
        assert!(SessionState::ShuttingDown.is_terminal());
        assert!(SessionState::Shutdown.is_terminal());
        assert!(!SessionState::Connecting.is_terminal());
    }

    #[test]
    fn connect_backoff_is_linear_and_capped() {
        // Free function math check without building a transport.
        let base = 10_000u64;
        let timeout = |attempts: u32| base * ((attempts + 1).min(CONNECT_BACKOFF_MAX) as u64);

        assert_eq!(timeout(0), 10_000);
        assert_eq!(timeout(1), 20_000);
        assert_eq!(timeout(4), 50_000);
        assert_eq!(timeout(5), 50_000);
        assert_eq!(timeout(100), 50_000);
    }
}
