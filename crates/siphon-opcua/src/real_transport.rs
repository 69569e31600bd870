// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Production transport backed by the `opcua` crate.
//!
//! Binds [`UaTransport`] onto the synchronous `opcua` client: discovery
//! against the no-security endpoint, anonymous session activation, and
//! the subscription services the engine consumes. Every blocking client
//! call runs on the blocking thread pool.
//!
//! Keep-alive events are synthesized from the client's connection state
//! at the cadence the engine requested; data-change callbacks registered
//! at subscription create time are forwarded into the session event
//! stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use opcua::client::prelude::{
    AttributeService, ClientBuilder, DataChangeCallback, IdentityToken, MessageSecurityMode,
    MonitoredItemService, Session, SubscriptionService,
};
use opcua::sync::RwLock as OpcRwLock;

use crate::error::{ConnectionError, SubscriptionError, UaError, UaResult};
use crate::transport::{
    ConnectOptions, ConnectedServer, CreatedItem, CreatedSubscription, ItemCreateRequest,
    ServerHandle, TransportEvent, UaTransport,
};
use crate::types::{
    AttributeId, DataValue, Identifier, MonitoringMode, StatusCode, UaNodeId, UaValue,
};

/// `Server_NamespaceArray` (ns=0).
const NAMESPACE_ARRAY_NODE: u32 = 2255;
/// `Server_ServerCapabilities_MinSupportedSampleRate` (ns=0).
const MIN_SUPPORTED_SAMPLE_RATE_NODE: u32 = 2272;

// =============================================================================
// RealUaTransport
// =============================================================================

/// [`UaTransport`] implementation over the `opcua` crate.
pub struct RealUaTransport {
    sessions: RwLock<HashMap<u64, RealSession>>,
    next_handle: AtomicU64,
}

struct RealSession {
    session: Arc<OpcRwLock<Session>>,
    /// Blocking task driving the client's publish loop.
    run_task: JoinHandle<()>,
    /// Task synthesizing keep-alive events.
    keep_alive_task: JoinHandle<()>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl RealUaTransport {
    /// Creates an empty transport.
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    async fn session(&self, server: ServerHandle) -> UaResult<Arc<OpcRwLock<Session>>> {
        self.sessions
            .read()
            .await
            .get(&server.0)
            .map(|s| Arc::clone(&s.session))
            .ok_or(UaError::Connection(ConnectionError::NotConnected))
    }

    /// Runs a blocking client call on the blocking pool.
    async fn blocking<F, R>(f: F) -> UaResult<R>
    where
        F: FnOnce() -> UaResult<R> + Send + 'static,
        R: Send + 'static,
    {
        match tokio::task::spawn_blocking(f).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "Blocking OPC UA call aborted");
                Err(UaError::service(StatusCode::BAD_UNEXPECTED_ERROR))
            }
        }
    }

    fn to_opcua_node_id(node: &UaNodeId) -> opcua::types::NodeId {
        match &node.identifier {
            Identifier::Numeric(v) => opcua::types::NodeId::new(node.namespace_index, *v),
            Identifier::String(v) => opcua::types::NodeId::new(node.namespace_index, v.clone()),
            Identifier::Guid(v) => {
                opcua::types::NodeId::new(node.namespace_index, opcua::types::Guid::from(*v))
            }
            Identifier::Opaque(v) => opcua::types::NodeId::new(
                node.namespace_index,
                opcua::types::ByteString::from(v.as_slice()),
            ),
        }
    }

    fn read_value_id(node: &UaNodeId, attribute: AttributeId) -> opcua::types::ReadValueId {
        opcua::types::ReadValueId {
            node_id: Self::to_opcua_node_id(node),
            attribute_id: attribute.value(),
            index_range: opcua::types::UAString::null(),
            data_encoding: opcua::types::QualifiedName::null(),
        }
    }

    fn from_opcua_variant(variant: &opcua::types::Variant) -> UaValue {
        use opcua::types::Variant;
        match variant {
            Variant::Empty => UaValue::Null,
            Variant::Boolean(v) => UaValue::Boolean(*v),
            Variant::SByte(v) => UaValue::SByte(*v),
            Variant::Byte(v) => UaValue::Byte(*v),
            Variant::Int16(v) => UaValue::Int16(*v),
            Variant::UInt16(v) => UaValue::UInt16(*v),
            Variant::Int32(v) => UaValue::Int32(*v),
            Variant::UInt32(v) => UaValue::UInt32(*v),
            Variant::Int64(v) => UaValue::Int64(*v),
            Variant::UInt64(v) => UaValue::UInt64(*v),
            Variant::Float(v) => UaValue::Float(*v),
            Variant::Double(v) => UaValue::Double(*v),
            Variant::String(v) => UaValue::String(v.as_ref().to_string()),
            Variant::LocalizedText(v) => UaValue::String(v.text.as_ref().to_string()),
            Variant::DateTime(v) => UaValue::DateTime(v.as_chrono()),
            Variant::Guid(v) => UaValue::Guid(uuid::Uuid::from_bytes(*v.as_bytes())),
            Variant::ByteString(v) => UaValue::ByteString(v.value.clone().unwrap_or_default()),
            Variant::Array(arr) => {
                UaValue::Array(arr.values.iter().map(Self::from_opcua_variant).collect())
            }
            other => UaValue::String(format!("{:?}", other)),
        }
    }

    fn from_opcua_data_value(dv: &opcua::types::DataValue) -> DataValue {
        DataValue {
            value: dv.value.as_ref().map(Self::from_opcua_variant),
            status: StatusCode(dv.status.map(|s| s.bits()).unwrap_or(0)),
            source_timestamp: dv.source_timestamp.as_ref().map(|t| t.as_chrono()),
            server_timestamp: dv.server_timestamp.as_ref().map(|t| t.as_chrono()),
        }
    }

    /// Reads one value and returns the raw variant, or the bad status.
    async fn read_single(
        &self,
        server: ServerHandle,
        node: UaNodeId,
        attribute: AttributeId,
    ) -> UaResult<opcua::types::DataValue> {
        let session = self.session(server).await?;
        Self::blocking(move || {
            let session = session.read();
            let values = session
                .read(
                    &[Self::read_value_id(&node, attribute)],
                    opcua::types::TimestampsToReturn::Neither,
                    0.0,
                )
                .map_err(|status| UaError::service(StatusCode(status.bits())))?;
            values
                .into_iter()
                .next()
                .ok_or_else(|| UaError::service(StatusCode::BAD_UNEXPECTED_ERROR))
        })
        .await
    }
}

impl Default for RealUaTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UaTransport for RealUaTransport {
    async fn connect(
        &self,
        endpoint_url: &str,
        options: ConnectOptions,
    ) -> UaResult<ConnectedServer> {
        let endpoint = endpoint_url.trim().to_string();
        let timeout = options.timeout;

        info!(endpoint = %endpoint, timeout_ms = timeout.as_millis() as u64, "Connecting OPC UA client");

        // Discovery + session activation on the blocking pool, bounded
        // by the caller's backoff timeout. An attempt that outlives the
        // timeout is abandoned; its session drops when the closure ends.
        let connect_endpoint = endpoint.clone();
        let application_name = options.application_name.clone();
        let session_timeout_ms = options.session_timeout_ms;
        let attempt = tokio::time::timeout(
            timeout,
            Self::blocking(move || {
                let client = ClientBuilder::new()
                    .application_name(application_name.as_str())
                    .application_uri(format!("urn:{}", application_name).as_str())
                    .session_retry_limit(0)
                    .session_timeout(session_timeout_ms as u32)
                    .trust_server_certs(false)
                    .create_sample_keypair(false)
                    .client();
                let mut client = client.ok_or_else(|| {
                    UaError::Connection(ConnectionError::refused(
                        &connect_endpoint,
                        "failed to build OPC UA client",
                    ))
                })?;

                let endpoints = client
                    .get_server_endpoints_from_url(&connect_endpoint)
                    .map_err(|status| {
                        UaError::Connection(ConnectionError::discovery(
                            &connect_endpoint,
                            StatusCode(status.bits()).to_string(),
                        ))
                    })?;

                // Security is disabled for this bridge: pick the
                // no-security endpoint or fail.
                let selected = endpoints
                    .into_iter()
                    .find(|e| {
                        e.security_mode == MessageSecurityMode::None
                            && e.security_policy_uri.as_ref().ends_with("#None")
                    })
                    .ok_or_else(|| {
                        UaError::Connection(ConnectionError::discovery(
                            &connect_endpoint,
                            "server offers no SecurityPolicy=None endpoint",
                        ))
                    })?;
                let application_uri = selected.server.application_uri.as_ref().to_string();

                let session = client
                    .connect_to_endpoint(selected, IdentityToken::Anonymous)
                    .map_err(|status| {
                        UaError::Connection(ConnectionError::refused(
                            &connect_endpoint,
                            StatusCode(status.bits()).to_string(),
                        ))
                    })?;
                Ok((session, application_uri))
            }),
        )
        .await;

        let (session, application_uri) = match attempt {
            Ok(result) => result?,
            Err(_) => {
                return Err(UaError::Connection(ConnectionError::timeout(
                    &endpoint,
                    timeout.as_millis() as u64,
                )));
            }
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        // Drive the client's publish loop; returns once the session
        // disconnects.
        let run_session = Arc::clone(&session);
        let run_task = tokio::task::spawn_blocking(move || {
            Session::run(run_session);
        });

        // Synthesize keep-alives from the connection state.
        let ka_session = Arc::clone(&session);
        let ka_events = events_tx.clone();
        let ka_interval = options.keep_alive_interval;
        let keep_alive_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ka_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let connected = ka_session.read().is_connected();
                let status = if connected {
                    StatusCode::GOOD
                } else {
                    StatusCode::BAD_NO_COMMUNICATION
                };
                if ka_events.send(TransportEvent::KeepAlive(status)).is_err() {
                    break;
                }
            }
        });

        let handle = ServerHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.sessions.write().await.insert(
            handle.0,
            RealSession {
                session,
                run_task,
                keep_alive_task,
                events: events_tx,
            },
        );

        info!(endpoint = %endpoint, server = %handle, application_uri = %application_uri, "OPC UA client connected");
        Ok(ConnectedServer {
            handle,
            application_uri,
            events: events_rx,
        })
    }

    async fn close_session(&self, server: ServerHandle) -> UaResult<()> {
        let Some(real) = self.sessions.write().await.remove(&server.0) else {
            return Ok(());
        };

        real.keep_alive_task.abort();
        let session = Arc::clone(&real.session);
        let _ = Self::blocking(move || {
            session.read().disconnect();
            Ok(())
        })
        .await;
        // The publish loop returns once the session disconnects.
        let _ = real.run_task.await;

        debug!(server = %server, "OPC UA session closed");
        Ok(())
    }

    async fn read_namespace_array(&self, server: ServerHandle) -> UaResult<Vec<String>> {
        let value = self
            .read_single(
                server,
                UaNodeId::numeric(0, NAMESPACE_ARRAY_NODE),
                AttributeId::Value,
            )
            .await?;

        match value.value {
            Some(opcua::types::Variant::Array(array)) => Ok(array
                .values
                .iter()
                .map(|v| match v {
                    opcua::types::Variant::String(s) => s.as_ref().to_string(),
                    other => format!("{:?}", other),
                })
                .collect()),
            _ => Err(UaError::service(StatusCode::BAD_UNEXPECTED_ERROR)),
        }
    }

    async fn read_min_supported_sampling_interval(
        &self,
        server: ServerHandle,
    ) -> UaResult<Option<u64>> {
        let value = self
            .read_single(
                server,
                UaNodeId::numeric(0, MIN_SUPPORTED_SAMPLE_RATE_NODE),
                AttributeId::Value,
            )
            .await?;

        Ok(match value.value {
            Some(opcua::types::Variant::Double(ms)) if ms > 0.0 => Some(ms as u64),
            Some(opcua::types::Variant::Float(ms)) if ms > 0.0 => Some(ms as u64),
            _ => None,
        })
    }

    async fn read_display_name(&self, server: ServerHandle, node: &UaNodeId) -> UaResult<String> {
        let value = self
            .read_single(server, node.clone(), AttributeId::DisplayName)
            .await?;

        match value.value {
            Some(opcua::types::Variant::LocalizedText(text)) => Ok(text.text.as_ref().to_string()),
            Some(other) => Ok(format!("{:?}", other)),
            None => Err(UaError::service(StatusCode(
                value.status.map(|s| s.bits()).unwrap_or(0),
            ))),
        }
    }

    async fn create_subscription(
        &self,
        server: ServerHandle,
        requested_publishing_interval_ms: u64,
    ) -> UaResult<CreatedSubscription> {
        let session = self.session(server).await?;
        let events = self
            .sessions
            .read()
            .await
            .get(&server.0)
            .map(|s| s.events.clone())
            .ok_or(UaError::Connection(ConnectionError::NotConnected))?;

        // The callback outlives this call; the subscription id it tags
        // events with is filled in right after the create returns.
        let subscription_id_slot = Arc::new(AtomicU32::new(0));
        let slot = Arc::clone(&subscription_id_slot);
        let callback = DataChangeCallback::new(move |items| {
            let subscription_id = slot.load(Ordering::SeqCst);
            for item in items {
                let event = TransportEvent::DataChange {
                    subscription_id,
                    client_handle: item.client_handle(),
                    value: Self::from_opcua_data_value(item.last_value()),
                };
                if events.send(event).is_err() {
                    return;
                }
            }
        });

        let subscription_id = Self::blocking(move || {
            let session = session.read();
            session
                .create_subscription(
                    requested_publishing_interval_ms as f64,
                    // Lifetime and keep-alive counts follow the usual
                    // 10:1 ratio servers expect.
                    30,
                    3,
                    0,
                    0,
                    true,
                    callback,
                )
                .map_err(|status| {
                    UaError::Subscription(SubscriptionError::creation_failed(
                        StatusCode(status.bits()).to_string(),
                    ))
                })
        })
        .await?;
        subscription_id_slot.store(subscription_id, Ordering::SeqCst);

        // The synchronous client applies the requested interval as-is;
        // it does not surface the server-revised value.
        Ok(CreatedSubscription {
            subscription_id,
            revised_publishing_interval_ms: requested_publishing_interval_ms,
        })
    }

    async fn delete_subscriptions(
        &self,
        server: ServerHandle,
        subscription_ids: &[u32],
    ) -> UaResult<()> {
        let session = self.session(server).await?;
        let ids = subscription_ids.to_vec();
        Self::blocking(move || {
            let session = session.read();
            for id in ids {
                if let Err(status) = session.delete_subscription(id) {
                    debug!(
                        subscription_id = id,
                        status = %StatusCode(status.bits()),
                        "Subscription delete rejected"
                    );
                }
            }
            Ok(())
        })
        .await
    }

    async fn set_publishing_mode(
        &self,
        server: ServerHandle,
        subscription_ids: &[u32],
        enabled: bool,
    ) -> UaResult<()> {
        let session = self.session(server).await?;
        let ids = subscription_ids.to_vec();
        Self::blocking(move || {
            let session = session.read();
            session
                .set_publishing_mode(&ids, enabled)
                .map_err(|status| UaError::service(StatusCode(status.bits())))?;
            Ok(())
        })
        .await
    }

    async fn create_monitored_item(
        &self,
        server: ServerHandle,
        subscription_id: u32,
        request: ItemCreateRequest,
    ) -> UaResult<CreatedItem> {
        let session = self.session(server).await?;

        let node_label = request.node.to_string();
        let create = opcua::types::MonitoredItemCreateRequest {
            item_to_monitor: Self::read_value_id(&request.node, request.attribute),
            monitoring_mode: match request.monitoring_mode {
                MonitoringMode::Disabled => opcua::types::MonitoringMode::Disabled,
                MonitoringMode::Sampling => opcua::types::MonitoringMode::Sampling,
                MonitoringMode::Reporting => opcua::types::MonitoringMode::Reporting,
            },
            requested_parameters: opcua::types::MonitoringParameters {
                client_handle: request.client_handle,
                sampling_interval: request.sampling_interval_ms as f64,
                filter: opcua::types::ExtensionObject::null(),
                queue_size: request.queue_size,
                discard_oldest: request.discard_oldest,
            },
        };

        let result = Self::blocking(move || {
            let session = session.read();
            let results = session
                .create_monitored_items(
                    subscription_id,
                    opcua::types::TimestampsToReturn::Both,
                    &[create],
                )
                .map_err(|status| UaError::service(StatusCode(status.bits())))?;
            results
                .into_iter()
                .next()
                .ok_or_else(|| UaError::service(StatusCode::BAD_UNEXPECTED_ERROR))
        })
        .await?;

        let status = StatusCode(result.status_code.bits());
        if status.is_bad() {
            // Surface the per-item status so the engine can classify
            // node faults (invalid/unknown node id vs transient).
            debug!(node = %node_label, status = %status, "Monitored item create rejected");
            return Err(UaError::service(status));
        }

        Ok(CreatedItem {
            item_handle: result.monitored_item_id,
            revised_sampling_interval_ms: result.revised_sampling_interval.max(0.0) as u64,
        })
    }

    async fn remove_monitored_items(
        &self,
        server: ServerHandle,
        subscription_id: u32,
        item_handles: &[u32],
    ) -> UaResult<()> {
        if item_handles.is_empty() {
            return Ok(());
        }
        let session = self.session(server).await?;
        let handles = item_handles.to_vec();
        Self::blocking(move || {
            let session = session.read();
            session
                .delete_monitored_items(subscription_id, &handles)
                .map_err(|status| UaError::service(StatusCode(status.bits())))?;
            Ok(())
        })
        .await
    }
}
