// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Error types for the reconciliation engine.
//!
//! Categories follow the failure dispositions the engine distinguishes:
//!
//! ```text
//! UaError
//! ├── Connection  - endpoint discovery and session establishment
//! ├── Session     - lifecycle violations on an established session
//! ├── Subscription- subscription and monitored-item services
//! ├── Identity    - node identity parsing and namespace resolution
//! ├── Service     - raw OPC UA service faults carrying a status code
//! └── Config      - published-nodes file handling
//! ```
//!
//! `Service` faults keep their [`StatusCode`] so the reconciliation loop
//! can classify them (session death, permanent node fault, transient).

use thiserror::Error;

use crate::types::StatusCode;

/// Result alias for engine operations.
pub type UaResult<T> = Result<T, UaError>;

// =============================================================================
// UaError
// =============================================================================

/// The engine's top-level error type.
#[derive(Debug, Error)]
pub enum UaError {
    /// Connection-level failure.
    #[error("{0}")]
    Connection(#[from] ConnectionError),

    /// Session lifecycle violation.
    #[error("{0}")]
    Session(#[from] SessionError),

    /// Subscription or monitored-item service failure.
    #[error("{0}")]
    Subscription(#[from] SubscriptionError),

    /// Node identity parsing or namespace resolution failure.
    #[error("{0}")]
    Identity(#[from] IdentityError),

    /// A service call completed with a bad status code.
    #[error("Service fault: {0}")]
    Service(StatusCode),

    /// Published-nodes file failure.
    #[error("{0}")]
    Config(#[from] siphon_config::ConfigError),
}

impl UaError {
    /// Creates a service-fault error from a status code.
    pub fn service(status: StatusCode) -> Self {
        Self::Service(status)
    }

    /// Returns the service status code if this error carries one.
    pub fn service_status(&self) -> Option<StatusCode> {
        match self {
            Self::Service(status) => Some(*status),
            _ => None,
        }
    }

    /// Returns `true` if the next reconciliation pass may succeed where
    /// this one failed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(_) => true,
            Self::Session(e) => e.is_retryable(),
            Self::Subscription(_) => true,
            Self::Identity(e) => e.is_retryable(),
            Self::Service(status) => {
                *status != StatusCode::BAD_NODE_ID_INVALID
                    && *status != StatusCode::BAD_NODE_ID_UNKNOWN
            }
            Self::Config(_) => false,
        }
    }
}

// =============================================================================
// ConnectionError
// =============================================================================

/// Failures while reaching or leaving an endpoint.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The endpoint did not accept a session within the timeout.
    #[error("Connect to '{endpoint}' timed out after {timeout_ms} ms")]
    Timeout {
        /// Endpoint URL.
        endpoint: String,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// Endpoint discovery failed.
    #[error("Endpoint discovery failed for '{endpoint}': {message}")]
    Discovery {
        /// Endpoint URL.
        endpoint: String,
        /// Diagnostics.
        message: String,
    },

    /// The server refused the session.
    #[error("Connect to '{endpoint}' refused: {message}")]
    Refused {
        /// Endpoint URL.
        endpoint: String,
        /// Diagnostics.
        message: String,
    },

    /// An operation needed a live session but none exists.
    #[error("Not connected")]
    NotConnected,
}

impl ConnectionError {
    /// Creates a connect-timeout error.
    pub fn timeout(endpoint: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            endpoint: endpoint.into(),
            timeout_ms,
        }
    }

    /// Creates a discovery error.
    pub fn discovery(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Discovery {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Creates a refused error.
    pub fn refused(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Refused {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }
}

// =============================================================================
// SessionError
// =============================================================================

/// Lifecycle violations on a session object.
#[derive(Debug, Error)]
pub enum SessionError {
    /// An operation was attempted in a state that does not allow it.
    #[error("Invalid session state: expected {expected}, found {actual}")]
    InvalidState {
        /// Required state.
        expected: String,
        /// Observed state.
        actual: String,
    },

    /// The session has been shut down; no further operations are legal.
    #[error("Session is shut down")]
    Terminated,
}

impl SessionError {
    /// Creates an invalid-state error.
    pub fn invalid_state(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::InvalidState {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(self, Self::InvalidState { .. })
    }
}

// =============================================================================
// SubscriptionError
// =============================================================================

/// Subscription and monitored-item service failures.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    /// The server rejected the subscription create.
    #[error("Subscription create failed: {message}")]
    CreationFailed {
        /// Diagnostics.
        message: String,
    },

    /// The server rejected a monitored-item create.
    #[error("Monitored item create failed for '{node}': {status}")]
    ItemCreateFailed {
        /// The node that was being added.
        node: String,
        /// Server-reported status.
        status: StatusCode,
    },

    /// A service referenced a subscription the server does not know.
    #[error("Unknown subscription id {subscription_id}")]
    UnknownSubscription {
        /// The offending id.
        subscription_id: u32,
    },
}

impl SubscriptionError {
    /// Creates a subscription-create failure.
    pub fn creation_failed(message: impl Into<String>) -> Self {
        Self::CreationFailed {
            message: message.into(),
        }
    }

    /// Creates a monitored-item-create failure.
    pub fn item_create_failed(node: impl Into<String>, status: StatusCode) -> Self {
        Self::ItemCreateFailed {
            node: node.into(),
            status,
        }
    }
}

// =============================================================================
// IdentityError
// =============================================================================

/// Node identity parsing and namespace resolution failures.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// A node identity string could not be parsed.
    #[error("Invalid node identity '{input}': {message}")]
    InvalidNodeId {
        /// The offending string.
        input: String,
        /// What was wrong with it.
        message: String,
    },

    /// The namespace table has no entry at the given index.
    #[error("Namespace index {index} is not in the server namespace table")]
    UnknownNamespaceIndex {
        /// The unresolvable index.
        index: u16,
    },

    /// The namespace table has no entry for the given URI.
    #[error("Namespace URI '{uri}' is not in the server namespace table")]
    UnknownNamespaceUri {
        /// The unresolvable URI.
        uri: String,
    },
}

impl IdentityError {
    /// Creates an invalid-node-id error.
    pub fn invalid_node_id(input: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidNodeId {
            input: input.into(),
            message: message.into(),
        }
    }

    fn is_retryable(&self) -> bool {
        // Unknown namespaces may appear after a reconnect refreshes the
        // table; malformed strings never heal.
        !matches!(self, Self::InvalidNodeId { .. })
    }
}
