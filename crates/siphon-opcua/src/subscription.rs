// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Subscriptions: groups of monitored items sharing a publishing
//! interval on one session.
//!
//! The owning session keys its subscriptions by requested publishing
//! interval, so "no two subscriptions share an interval" holds by
//! construction and find-or-create is a map lookup.

use crate::monitored_item::{MonitorState, MonitoredItem};
use crate::types::{NamespaceTable, NodeIdentity};

/// A group of monitored items with one publishing interval.
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Publishing interval requested from the server.
    pub requested_publishing_interval_ms: u64,

    /// Publishing interval the server granted, once created.
    pub revised_publishing_interval_ms: Option<u64>,

    /// Server-side subscription id; `None` until created.
    pub server_handle: Option<u32>,

    /// Monitored items, in insertion order.
    pub items: Vec<MonitoredItem>,
}

impl Subscription {
    /// Creates an empty subscription for the given interval.
    pub fn new(requested_publishing_interval_ms: u64) -> Self {
        Self {
            requested_publishing_interval_ms,
            revised_publishing_interval_ms: None,
            server_handle: None,
            items: Vec::new(),
        }
    }

    /// Records the server-side create result.
    pub fn mark_created(&mut self, server_handle: u32, revised_publishing_interval_ms: u64) {
        self.server_handle = Some(server_handle);
        self.revised_publishing_interval_ms = Some(revised_publishing_interval_ms);
    }

    /// Returns `true` when the subscription holds no items and is thus
    /// eligible for garbage collection.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Finds an item observing the queried node.
    pub fn find_item(&self, query: &NodeIdentity, table: &NamespaceTable) -> Option<&MonitoredItem> {
        self.items.iter().find(|i| i.matches_node(query, table))
    }

    /// Finds an item by its client handle.
    pub fn item_by_client_handle(&self, client_handle: u32) -> Option<&MonitoredItem> {
        self.items.iter().find(|i| i.client_handle == client_handle)
    }

    /// Tags every item matching the query for removal; returns how many
    /// were tagged.
    pub fn request_removal(&mut self, query: &NodeIdentity, table: &NamespaceTable) -> usize {
        let mut tagged = 0;
        for item in &mut self.items {
            if item.matches_node(query, table) {
                item.state = MonitorState::RemovalRequested;
                tagged += 1;
            }
        }
        tagged
    }

    /// Removes all items tagged `RemovalRequested` from the in-memory
    /// list and returns them (for server-side batch removal).
    pub fn take_removal_requested(&mut self) -> Vec<MonitoredItem> {
        let mut removed = Vec::new();
        self.items.retain_mut(|item| {
            if item.state == MonitorState::RemovalRequested {
                removed.push(item.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Resets server-side state after the session was lost.
    pub fn reset_after_disconnect(&mut self) {
        self.server_handle = None;
        self.revised_publishing_interval_ms = None;
        for item in &mut self.items {
            item.reset_after_disconnect();
        }
    }

    /// Server-side handles of all currently monitored items.
    pub fn monitored_item_handles(&self) -> Vec<u32> {
        self.items
            .iter()
            .filter_map(|i| i.server_handle)
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
