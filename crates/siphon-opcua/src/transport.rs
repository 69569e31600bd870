// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! The OPC UA client seam.
//!
//! The engine never talks to a protocol stack directly; it drives a
//! [`UaTransport`]. The trait covers exactly the services the
//! reconciliation loop consumes: discovery+connect, the three reads the
//! connect phase performs, subscription and monitored-item management,
//! and a per-session event stream delivering keep-alives and value
//! changes.
//!
//! Production uses the `opcua`-crate binding behind the `real-transport`
//! feature; tests drive the engine with a recording mock.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::UaResult;
use crate::types::{AttributeId, DataValue, MonitoringMode, StatusCode, UaNodeId};

// =============================================================================
// ServerHandle
// =============================================================================

/// Opaque handle to one established session inside a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerHandle(pub u64);

impl fmt::Display for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "srv-{}", self.0)
    }
}

// =============================================================================
// Connect types
// =============================================================================

/// Parameters for session establishment.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Overall deadline for discovery plus session creation. The caller
    /// computes this from its backoff policy.
    pub timeout: Duration,

    /// Requested session timeout.
    pub session_timeout_ms: u64,

    /// Keep-alive cadence the transport must emit events at.
    pub keep_alive_interval: Duration,

    /// Client application name presented to the server.
    pub application_name: String,
}

/// A freshly established session.
///
/// The events receiver is the only delivery path for keep-alives and
/// value-change notifications; dropping it detaches the stream.
#[derive(Debug)]
pub struct ConnectedServer {
    /// Handle for subsequent service calls.
    pub handle: ServerHandle,

    /// The server's application URI (stamped into every envelope).
    pub application_uri: String,

    /// Keep-alive and notification stream.
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Events pushed by the transport for one session.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Periodic liveness signal; bad status means a missed keep-alive.
    KeepAlive(StatusCode),

    /// A monitored item produced a value change.
    DataChange {
        /// Server-side subscription id.
        subscription_id: u32,
        /// Client handle the item was created with.
        client_handle: u32,
        /// The new value.
        value: DataValue,
    },
}

// =============================================================================
// Service request/result types
// =============================================================================

/// Result of a subscription create.
#[derive(Debug, Clone, Copy)]
pub struct CreatedSubscription {
    /// Server-side subscription id.
    pub subscription_id: u32,

    /// Publishing interval the server actually granted.
    pub revised_publishing_interval_ms: u64,
}

/// Parameters for a monitored-item create.
#[derive(Debug, Clone)]
pub struct ItemCreateRequest {
    /// The node to monitor, in concrete form.
    pub node: UaNodeId,

    /// Client handle echoed back in notifications.
    pub client_handle: u32,

    /// Requested sampling interval.
    pub sampling_interval_ms: u64,

    /// Requested queue size.
    pub queue_size: u32,

    /// Whether the server drops the oldest value on queue overflow.
    pub discard_oldest: bool,

    /// Monitoring mode.
    pub monitoring_mode: MonitoringMode,

    /// Attribute to monitor.
    pub attribute: AttributeId,
}

/// Result of a monitored-item create.
#[derive(Debug, Clone, Copy)]
pub struct CreatedItem {
    /// Server-side monitored item id (used for removal).
    pub item_handle: u32,

    /// Sampling interval the server actually granted.
    pub revised_sampling_interval_ms: u64,
}

// =============================================================================
// UaTransport
// =============================================================================

/// The OPC UA client contract consumed by the engine.
///
/// Implementations must be shareable across tasks; every method takes
/// `&self`. Service failures surface either as transport-level errors or
/// as [`UaError::Service`](crate::error::UaError::Service) carrying the
/// server's status code, which the reconciliation loop classifies.
#[async_trait]
pub trait UaTransport: Send + Sync + 'static {
    /// Discovers the endpoint (security disabled), creates and activates
    /// an anonymous session, and starts the keep-alive stream.
    async fn connect(
        &self,
        endpoint_url: &str,
        options: ConnectOptions,
    ) -> UaResult<ConnectedServer>;

    /// Closes the session. Safe to call on an already-dead session.
    async fn close_session(&self, server: ServerHandle) -> UaResult<()>;

    /// Reads the server's `NamespaceArray`.
    async fn read_namespace_array(&self, server: ServerHandle) -> UaResult<Vec<String>>;

    /// Reads `MinSupportedSampleRate`, when the server exposes it.
    async fn read_min_supported_sampling_interval(
        &self,
        server: ServerHandle,
    ) -> UaResult<Option<u64>>;

    /// Reads a node's `DisplayName` attribute.
    async fn read_display_name(&self, server: ServerHandle, node: &UaNodeId) -> UaResult<String>;

    /// Creates a server-side subscription.
    async fn create_subscription(
        &self,
        server: ServerHandle,
        requested_publishing_interval_ms: u64,
    ) -> UaResult<CreatedSubscription>;

    /// Deletes server-side subscriptions in one batch.
    async fn delete_subscriptions(
        &self,
        server: ServerHandle,
        subscription_ids: &[u32],
    ) -> UaResult<()>;

    /// Enables or disables publishing for the given subscriptions.
    async fn set_publishing_mode(
        &self,
        server: ServerHandle,
        subscription_ids: &[u32],
        enabled: bool,
    ) -> UaResult<()>;

    /// Creates one monitored item and applies the change.
    async fn create_monitored_item(
        &self,
        server: ServerHandle,
        subscription_id: u32,
        request: ItemCreateRequest,
    ) -> UaResult<CreatedItem>;

    /// Removes monitored items from a subscription in one batch.
    async fn remove_monitored_items(
        &self,
        server: ServerHandle,
        subscription_id: u32,
        item_handles: &[u32],
    ) -> UaResult<()>;
}
