// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Monitored items: the leaf entities of the engine.
//!
//! An item names a single node in one of the two identity forms, carries
//! its monitoring lifecycle state, and formats value-change notifications
//! into the egress envelope.

use tracing::warn;

use crate::envelope::{EnvelopeContext, TelemetryEnvelope};
use crate::error::{IdentityError, UaResult};
use crate::types::{
    AttributeId, DataValue, MonitoringMode, NamespaceTable, NodeIdentity, UaExpandedNodeId,
    UaNodeId,
};

// =============================================================================
// MonitorState
// =============================================================================

/// Lifecycle state of a monitored item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MonitorState {
    /// Not yet created on the server.
    #[default]
    Unmonitored,

    /// Not yet created; identity needs namespace reconciliation first.
    NamespaceUpdateRequested,

    /// Live on the server.
    Monitored,

    /// Tagged for removal; dropped on the next reconciliation pass.
    RemovalRequested,

    /// The server rejected the node id as invalid or unknown; the item
    /// is not retried until an operator removes and re-adds it.
    PermanentlyFailed,
}

impl MonitorState {
    /// Returns `true` for the states the monitor phase acts on.
    #[inline]
    pub fn is_pending_monitor(&self) -> bool {
        matches!(self, Self::Unmonitored | Self::NamespaceUpdateRequested)
    }
}

// =============================================================================
// MonitoredItem
// =============================================================================

/// A single node under observation.
#[derive(Debug, Clone)]
pub struct MonitoredItem {
    /// The node identity, in exactly one of the two forms.
    pub identity: NodeIdentity,

    /// Lifecycle state.
    pub state: MonitorState,

    /// Display name; empty until resolved at monitor time.
    pub display_name: String,

    /// Sampling interval requested from the server.
    pub requested_sampling_interval_ms: u64,

    /// Sampling interval the server granted, once monitored.
    pub revised_sampling_interval_ms: Option<u64>,

    /// Requested queue size.
    pub queue_size: u32,

    /// Drop-oldest behavior on queue overflow.
    pub discard_oldest: bool,

    /// Monitoring mode.
    pub monitoring_mode: MonitoringMode,

    /// Attribute under observation.
    pub attribute: AttributeId,

    /// Client handle echoed back in notifications.
    pub client_handle: u32,

    /// Server-side monitored item id; `None` while not monitored.
    pub server_handle: Option<u32>,
}

impl MonitoredItem {
    /// Creates an item in its initial state.
    ///
    /// `request_namespace_update` queues identity-form reconciliation for
    /// the next pass: runtime-added concrete ids get upgraded to the
    /// portable form, and portable ids get their namespace index
    /// resolved.
    pub fn new(
        identity: NodeIdentity,
        sampling_interval_ms: u64,
        client_handle: u32,
        request_namespace_update: bool,
    ) -> Self {
        let state = if request_namespace_update {
            MonitorState::NamespaceUpdateRequested
        } else {
            MonitorState::Unmonitored
        };
        Self {
            identity,
            state,
            display_name: String::new(),
            requested_sampling_interval_ms: sampling_interval_ms,
            revised_sampling_interval_ms: None,
            queue_size: 0,
            discard_oldest: true,
            monitoring_mode: MonitoringMode::Reporting,
            attribute: AttributeId::Value,
            client_handle,
            server_handle: None,
        }
    }

    // =========================================================================
    // Identity matching
    // =========================================================================

    /// Returns `true` if this item observes the queried node.
    ///
    /// Items tagged for removal never match, so a remove-then-add
    /// sequence creates a fresh item instead of resurrecting the doomed
    /// one. The namespace table bridges the two identity forms; when the
    /// bridge cannot be built (unpopulated table, unknown URI or index)
    /// the forms are simply considered distinct. Identifiers compare by
    /// stringified form, case-insensitively.
    pub fn matches_node(&self, query: &NodeIdentity, table: &NamespaceTable) -> bool {
        if self.state == MonitorState::RemovalRequested {
            return false;
        }

        match (&self.identity, query) {
            (NodeIdentity::Node(mine), NodeIdentity::Node(theirs)) => {
                mine.namespace_index == theirs.namespace_index
                    && mine.identifier.matches_text(&theirs.identifier)
            }
            (NodeIdentity::Node(mine), NodeIdentity::Expanded(theirs)) => {
                Self::node_matches_expanded(mine, theirs, table)
            }
            (NodeIdentity::Expanded(mine), NodeIdentity::Node(theirs)) => {
                Self::expanded_matches_node(mine, theirs, table)
            }
            (NodeIdentity::Expanded(mine), NodeIdentity::Expanded(theirs)) => {
                mine.namespace_uri.eq_ignore_ascii_case(&theirs.namespace_uri)
                    && mine.identifier.matches_text(&theirs.identifier)
            }
        }
    }

    fn node_matches_expanded(
        node: &UaNodeId,
        expanded: &UaExpandedNodeId,
        table: &NamespaceTable,
    ) -> bool {
        match table.uri(node.namespace_index) {
            Some(uri) => {
                uri.eq_ignore_ascii_case(&expanded.namespace_uri)
                    && node.identifier.matches_text(&expanded.identifier)
            }
            None => false,
        }
    }

    fn expanded_matches_node(
        expanded: &UaExpandedNodeId,
        node: &UaNodeId,
        table: &NamespaceTable,
    ) -> bool {
        match table.index_of(&expanded.namespace_uri) {
            Some(index) => {
                index == node.namespace_index
                    && expanded.identifier.matches_text(&node.identifier)
            }
            None => false,
        }
    }

    // =========================================================================
    // Namespace reconciliation
    // =========================================================================

    /// Performs the identity-form reconciliation queued by
    /// [`MonitorState::NamespaceUpdateRequested`].
    ///
    /// Portable identities get their namespace index resolved; concrete
    /// identities are upgraded to the portable form. On success the item
    /// is ready to monitor in the same pass. On failure the state is left
    /// untouched so the next pass retries against a fresh table.
    pub fn resolve_identity(&mut self, table: &NamespaceTable) -> UaResult<()> {
        match &mut self.identity {
            NodeIdentity::Expanded(expanded) => {
                let index = table.index_of(&expanded.namespace_uri).ok_or_else(|| {
                    IdentityError::UnknownNamespaceUri {
                        uri: expanded.namespace_uri.clone(),
                    }
                })?;
                expanded.namespace_index = Some(index);
            }
            NodeIdentity::Node(node) => {
                let uri = table
                    .uri(node.namespace_index)
                    .ok_or(IdentityError::UnknownNamespaceIndex {
                        index: node.namespace_index,
                    })?
                    .to_string();
                self.identity = NodeIdentity::Expanded(UaExpandedNodeId {
                    namespace_uri: uri,
                    identifier: node.identifier.clone(),
                    namespace_index: Some(node.namespace_index),
                });
            }
        }
        self.state = MonitorState::Unmonitored;
        Ok(())
    }

    /// The concrete node id sent to the server.
    pub fn effective_node_id(&self) -> UaResult<UaNodeId> {
        match &self.identity {
            NodeIdentity::Node(node) => Ok(node.clone()),
            NodeIdentity::Expanded(expanded) => expanded.to_node_id().ok_or_else(|| {
                IdentityError::UnknownNamespaceUri {
                    uri: expanded.namespace_uri.clone(),
                }
                .into()
            }),
        }
    }

    // =========================================================================
    // State transitions
    // =========================================================================

    /// Records a successful server-side create.
    pub fn mark_monitored(&mut self, server_handle: u32, revised_sampling_interval_ms: u64) {
        self.server_handle = Some(server_handle);
        self.revised_sampling_interval_ms = Some(revised_sampling_interval_ms);
        self.state = MonitorState::Monitored;
    }

    /// Resets server-side state after the session was lost.
    ///
    /// Portable identities go back to namespace reconciliation: the
    /// server may come back with a renumbered namespace table.
    pub fn reset_after_disconnect(&mut self) {
        self.server_handle = None;
        self.revised_sampling_interval_ms = None;
        match self.state {
            MonitorState::RemovalRequested | MonitorState::PermanentlyFailed => {}
            _ => {
                self.state = if self.identity.is_expanded() {
                    MonitorState::NamespaceUpdateRequested
                } else {
                    MonitorState::Unmonitored
                };
            }
        }
    }

    // =========================================================================
    // Notification encoding
    // =========================================================================

    /// Formats a value-change notification into the egress envelope.
    ///
    /// Valueless notifications are dropped silently; encoding failures
    /// are logged and swallowed. Notifications are never retried.
    pub fn encode_notification(&self, ctx: &EnvelopeContext, data: &DataValue) -> Option<String> {
        data.value.as_ref()?;

        let display_name = if self.display_name.is_empty() {
            self.identity.to_string()
        } else {
            self.display_name.clone()
        };

        let envelope =
            TelemetryEnvelope::new(ctx, display_name, self.identity.to_string(), data);
        match envelope.encode() {
            Ok(json) => Some(json),
            Err(e) => {
                warn!(
                    node = %self.identity,
                    error = %e,
                    "Failed to encode notification envelope; message dropped"
                );
                None
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
