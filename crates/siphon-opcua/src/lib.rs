// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Session and subscription reconciliation engine for the Siphon
//! OPC UA bridge.
//!
//! The engine keeps one long-lived client session per endpoint,
//! organizes monitored nodes into subscriptions grouped by publishing
//! interval, and periodically reconciles the live server-side state
//! against the desired configuration. Value-change notifications are
//! encoded into JSON envelopes and handed to the egress queue.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       SessionRegistry                           │
//! │     (session set, reconciliation driver, config persister)      │
//! └─────────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Session                                │
//! │   (per-endpoint state machine: connect / monitor / remove)      │
//! └─────────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │              Subscription → MonitoredItem                       │
//! │        (publishing-interval groups of observed nodes)           │
//! └─────────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      UaTransport (trait)                        │
//! │          (protocol client seam; real or test double)            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod envelope;
pub mod error;
pub mod monitored_item;
pub mod registry;
pub mod session;
pub mod shutdown;
pub mod subscription;
pub mod transport;
pub mod types;

#[cfg(feature = "real-transport")]
pub mod real_transport;

pub use envelope::{EnvelopeContext, TelemetryEnvelope, WireDataValue};
pub use error::{
    ConnectionError, IdentityError, SessionError, SubscriptionError, UaError, UaResult,
};
pub use monitored_item::{MonitorState, MonitoredItem};
pub use registry::{PublisherSettings, SessionRegistry};
pub use session::{PublishedNode, Session, SessionConfig, SessionState, CONNECT_BACKOFF_MAX};
pub use shutdown::ShutdownToken;
pub use subscription::Subscription;
pub use transport::{
    ConnectOptions, ConnectedServer, CreatedItem, CreatedSubscription, ItemCreateRequest,
    ServerHandle, TransportEvent, UaTransport,
};
pub use types::{
    AttributeId, DataValue, Identifier, MonitoringMode, NamespaceTable, NodeIdentity, StatusCode,
    UaExpandedNodeId, UaNodeId, UaValue,
};

#[cfg(feature = "real-transport")]
pub use real_transport::RealUaTransport;
