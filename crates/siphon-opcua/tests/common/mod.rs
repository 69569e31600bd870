// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Recording mock transport for reconciliation tests.
//!
//! The mock plays the OPC UA server side: it tracks sessions,
//! subscriptions, and monitored items, records every service call for
//! verification, and exposes fault-injection knobs (connect failures,
//! per-node create faults, keep-alive injection).

// Not every knob is exercised by every test binary.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use siphon_opcua::{
    ConnectOptions, ConnectedServer, ConnectionError, CreatedItem, CreatedSubscription,
    DataValue, ItemCreateRequest, ServerHandle, StatusCode, TransportEvent, UaError, UaResult,
    UaTransport,
};

/// Default namespace table the mock reports.
pub fn default_namespaces() -> Vec<String> {
    vec![
        "http://opcfoundation.org/UA/".to_string(),
        "urn:mock:ns1".to_string(),
        "urn:mock:ns2".to_string(),
    ]
}

#[derive(Debug)]
struct MockSubscription {
    publishing_interval_ms: u64,
    /// item handle -> (node string, client handle)
    items: HashMap<u32, (String, u32)>,
}

#[derive(Debug)]
struct MockServer {
    endpoint: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    subscriptions: HashMap<u32, MockSubscription>,
    /// When set, every service call answers `BadSessionIdInvalid`.
    poisoned: bool,
}

#[derive(Default)]
struct MockConfig {
    /// Per-endpoint namespace arrays; endpoints not listed use the
    /// defaults.
    namespaces: HashMap<String, Vec<String>>,
    /// Per-node create faults keyed by the effective `ns=` node string.
    item_faults: HashMap<String, StatusCode>,
    min_supported_sampling_ms: Option<u64>,
    application_uri: String,
}

/// The recording mock transport.
pub struct MockTransport {
    config: Mutex<MockConfig>,
    servers: Mutex<HashMap<u64, MockServer>>,
    next_server: AtomicU64,
    next_subscription: AtomicU32,
    next_item: AtomicU32,

    fail_all_connects: AtomicBool,
    fail_next_connect: AtomicBool,

    pub connect_attempts: AtomicU32,
    pub connects: AtomicU32,
    pub session_closes: AtomicU32,
    pub subscription_creates: AtomicU32,
    pub item_creates: AtomicU32,
    pub publishing_mode_calls: AtomicU32,

    /// Every node string ever sent in a monitored-item create.
    pub created_nodes: Mutex<Vec<String>>,
    /// Every batch of item handles removed.
    pub removed_items: Mutex<Vec<Vec<u32>>>,
    /// Every batch of subscription ids deleted.
    pub deleted_subscriptions: Mutex<Vec<Vec<u32>>>,
    /// Connect timeout of every attempt, in order.
    pub connect_timeouts: Mutex<Vec<u64>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            config: Mutex::new(MockConfig {
                namespaces: HashMap::new(),
                item_faults: HashMap::new(),
                min_supported_sampling_ms: None,
                application_uri: "urn:mock:server".to_string(),
            }),
            servers: Mutex::new(HashMap::new()),
            next_server: AtomicU64::new(1),
            next_subscription: AtomicU32::new(100),
            next_item: AtomicU32::new(1000),
            fail_all_connects: AtomicBool::new(false),
            fail_next_connect: AtomicBool::new(false),
            connect_attempts: AtomicU32::new(0),
            connects: AtomicU32::new(0),
            session_closes: AtomicU32::new(0),
            subscription_creates: AtomicU32::new(0),
            item_creates: AtomicU32::new(0),
            publishing_mode_calls: AtomicU32::new(0),
            created_nodes: Mutex::new(Vec::new()),
            removed_items: Mutex::new(Vec::new()),
            deleted_subscriptions: Mutex::new(Vec::new()),
            connect_timeouts: Mutex::new(Vec::new()),
        }
    }

    // =========================================================================
    // Test configuration
    // =========================================================================

    pub fn set_namespaces(&self, endpoint: &str, namespaces: Vec<String>) {
        self.config
            .lock()
            .unwrap()
            .namespaces
            .insert(endpoint.to_string(), namespaces);
    }

    pub fn set_application_uri(&self, uri: &str) {
        self.config.lock().unwrap().application_uri = uri.to_string();
    }

    pub fn set_min_supported_sampling_ms(&self, value: Option<u64>) {
        self.config.lock().unwrap().min_supported_sampling_ms = value;
    }

    /// Makes every create for the given `ns=` node string fail with the
    /// given status.
    pub fn fail_item_create(&self, node: &str, status: StatusCode) {
        self.config
            .lock()
            .unwrap()
            .item_faults
            .insert(node.to_string(), status);
    }

    pub fn clear_item_faults(&self) {
        self.config.lock().unwrap().item_faults.clear();
    }

    pub fn fail_all_connects(&self, fail: bool) {
        self.fail_all_connects.store(fail, Ordering::SeqCst);
    }

    pub fn fail_next_connect(&self) {
        self.fail_next_connect.store(true, Ordering::SeqCst);
    }

    /// Marks the live session for an endpoint as dead server-side:
    /// every subsequent service call answers `BadSessionIdInvalid`.
    pub fn poison_session(&self, endpoint: &str) {
        let mut servers = self.servers.lock().unwrap();
        for server in servers.values_mut() {
            if server.endpoint == endpoint {
                server.poisoned = true;
            }
        }
    }

    // =========================================================================
    // Event injection
    // =========================================================================

    /// Sends `count` keep-alive events with the given status to the live
    /// session for an endpoint.
    pub fn emit_keep_alives(&self, endpoint: &str, status: StatusCode, count: u32) {
        let servers = self.servers.lock().unwrap();
        for server in servers.values() {
            if server.endpoint == endpoint {
                for _ in 0..count {
                    let _ = server.events.send(TransportEvent::KeepAlive(status));
                }
            }
        }
    }

    /// Emits a data change for the monitored item observing the given
    /// `ns=` node string. Returns `true` if a live item was found.
    pub fn emit_data_change(&self, endpoint: &str, node: &str, value: DataValue) -> bool {
        let servers = self.servers.lock().unwrap();
        for server in servers.values() {
            if server.endpoint != endpoint {
                continue;
            }
            for (sub_id, sub) in &server.subscriptions {
                for (node_str, client_handle) in sub.items.values() {
                    if node_str == node {
                        let _ = server.events.send(TransportEvent::DataChange {
                            subscription_id: *sub_id,
                            client_handle: *client_handle,
                            value,
                        });
                        return true;
                    }
                }
            }
        }
        false
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn live_session_count(&self) -> usize {
        self.servers.lock().unwrap().len()
    }

    pub fn live_item_count(&self, endpoint: &str) -> usize {
        self.servers
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.endpoint == endpoint)
            .map(|s| s.subscriptions.values().map(|sub| sub.items.len()).sum::<usize>())
            .sum()
    }

    pub fn live_subscription_intervals(&self, endpoint: &str) -> Vec<u64> {
        let servers = self.servers.lock().unwrap();
        let mut intervals: Vec<u64> = servers
            .values()
            .filter(|s| s.endpoint == endpoint)
            .flat_map(|s| s.subscriptions.values().map(|sub| sub.publishing_interval_ms))
            .collect();
        intervals.sort_unstable();
        intervals
    }

    fn with_server<R>(
        &self,
        handle: ServerHandle,
        f: impl FnOnce(&mut MockServer) -> UaResult<R>,
    ) -> UaResult<R> {
        let mut servers = self.servers.lock().unwrap();
        let server = servers
            .get_mut(&handle.0)
            .ok_or(UaError::Connection(ConnectionError::NotConnected))?;
        if server.poisoned {
            return Err(UaError::service(StatusCode::BAD_SESSION_ID_INVALID));
        }
        f(server)
    }
}

#[async_trait]
impl UaTransport for MockTransport {
    async fn connect(
        &self,
        endpoint_url: &str,
        options: ConnectOptions,
    ) -> UaResult<ConnectedServer> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        self.connect_timeouts
            .lock()
            .unwrap()
            .push(options.timeout.as_millis() as u64);

        if self.fail_all_connects.load(Ordering::SeqCst)
            || self.fail_next_connect.swap(false, Ordering::SeqCst)
        {
            return Err(UaError::Connection(ConnectionError::refused(
                endpoint_url,
                "mock connect failure",
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ServerHandle(self.next_server.fetch_add(1, Ordering::SeqCst));
        self.servers.lock().unwrap().insert(
            handle.0,
            MockServer {
                endpoint: endpoint_url.to_string(),
                events: tx,
                subscriptions: HashMap::new(),
                poisoned: false,
            },
        );
        self.connects.fetch_add(1, Ordering::SeqCst);

        Ok(ConnectedServer {
            handle,
            application_uri: self.config.lock().unwrap().application_uri.clone(),
            events: rx,
        })
    }

    async fn close_session(&self, server: ServerHandle) -> UaResult<()> {
        self.session_closes.fetch_add(1, Ordering::SeqCst);
        self.servers.lock().unwrap().remove(&server.0);
        Ok(())
    }

    async fn read_namespace_array(&self, server: ServerHandle) -> UaResult<Vec<String>> {
        let endpoint = self.with_server(server, |s| Ok(s.endpoint.clone()))?;
        let config = self.config.lock().unwrap();
        Ok(config
            .namespaces
            .get(&endpoint)
            .cloned()
            .unwrap_or_else(default_namespaces))
    }

    async fn read_min_supported_sampling_interval(
        &self,
        server: ServerHandle,
    ) -> UaResult<Option<u64>> {
        self.with_server(server, |_| Ok(()))?;
        Ok(self.config.lock().unwrap().min_supported_sampling_ms)
    }

    async fn read_display_name(&self, server: ServerHandle, node: &siphon_opcua::UaNodeId) -> UaResult<String> {
        self.with_server(server, |_| Ok(()))?;
        Ok(format!("DisplayName({})", node))
    }

    async fn create_subscription(
        &self,
        server: ServerHandle,
        requested_publishing_interval_ms: u64,
    ) -> UaResult<CreatedSubscription> {
        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        self.with_server(server, |s| {
            s.subscriptions.insert(
                id,
                MockSubscription {
                    publishing_interval_ms: requested_publishing_interval_ms,
                    items: HashMap::new(),
                },
            );
            Ok(())
        })?;
        self.subscription_creates.fetch_add(1, Ordering::SeqCst);
        Ok(CreatedSubscription {
            subscription_id: id,
            revised_publishing_interval_ms: requested_publishing_interval_ms,
        })
    }

    async fn delete_subscriptions(
        &self,
        server: ServerHandle,
        subscription_ids: &[u32],
    ) -> UaResult<()> {
        self.deleted_subscriptions
            .lock()
            .unwrap()
            .push(subscription_ids.to_vec());
        self.with_server(server, |s| {
            for id in subscription_ids {
                s.subscriptions.remove(id);
            }
            Ok(())
        })
    }

    async fn set_publishing_mode(
        &self,
        server: ServerHandle,
        _subscription_ids: &[u32],
        _enabled: bool,
    ) -> UaResult<()> {
        self.publishing_mode_calls.fetch_add(1, Ordering::SeqCst);
        self.with_server(server, |_| Ok(()))
    }

    async fn create_monitored_item(
        &self,
        server: ServerHandle,
        subscription_id: u32,
        request: ItemCreateRequest,
    ) -> UaResult<CreatedItem> {
        let node = request.node.to_string();

        if let Some(status) = self.config.lock().unwrap().item_faults.get(&node) {
            return Err(UaError::service(*status));
        }

        let item_handle = self.next_item.fetch_add(1, Ordering::SeqCst);
        self.with_server(server, |s| {
            let sub = s.subscriptions.get_mut(&subscription_id).ok_or_else(|| {
                UaError::service(StatusCode::BAD_UNEXPECTED_ERROR)
            })?;
            sub.items
                .insert(item_handle, (node.clone(), request.client_handle));
            Ok(())
        })?;

        self.item_creates.fetch_add(1, Ordering::SeqCst);
        self.created_nodes.lock().unwrap().push(node);
        Ok(CreatedItem {
            item_handle,
            revised_sampling_interval_ms: request.sampling_interval_ms,
        })
    }

    async fn remove_monitored_items(
        &self,
        server: ServerHandle,
        subscription_id: u32,
        item_handles: &[u32],
    ) -> UaResult<()> {
        self.removed_items
            .lock()
            .unwrap()
            .push(item_handles.to_vec());
        self.with_server(server, |s| {
            if let Some(sub) = s.subscriptions.get_mut(&subscription_id) {
                for handle in item_handles {
                    sub.items.remove(handle);
                }
            }
            Ok(())
        })
    }
}
