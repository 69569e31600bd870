// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Core OPC UA types for the reconciliation engine.
//!
//! - **UaNodeId / UaExpandedNodeId**: the two node identity forms, with
//!   `ns=...;i=...` / `nsu=...;i=...` parsing and printing
//! - **NodeIdentity**: the tagged sum of the two forms
//! - **NamespaceTable**: the server-supplied `index → URI` array
//! - **UaValue / DataValue**: value-change payloads
//! - **StatusCode**: OPC UA service result codes
//!
//! # Examples
//!
//! ```
//! use siphon_opcua::types::NodeIdentity;
//!
//! let concrete: NodeIdentity = "ns=2;i=1001".parse().unwrap();
//! assert!(matches!(concrete, NodeIdentity::Node(_)));
//!
//! let portable: NodeIdentity = "nsu=urn:factory:line1;i=1001".parse().unwrap();
//! assert!(matches!(portable, NodeIdentity::Expanded(_)));
//! ```

use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::IdentityError;

// =============================================================================
// Identifier
// =============================================================================

/// The identifier half of a node identity.
///
/// OPC UA defines four identifier types. Textual equality (stringified,
/// case-insensitive) is the only comparison the engine performs across
/// identity forms; typed equality is deliberately not attempted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Identifier {
    /// Numeric identifier.
    Numeric(u32),

    /// String identifier.
    String(String),

    /// GUID identifier.
    Guid(Uuid),

    /// Opaque identifier (application-specific bytes).
    Opaque(Vec<u8>),
}

impl Identifier {
    /// Parses an identifier part such as `i=1001`, `s=Line1.Speed`,
    /// `g=<uuid>`, or `b=<base64>`.
    pub fn parse_part(part: &str) -> Result<Self, IdentityError> {
        if let Some(v) = part.strip_prefix("i=") {
            let value: u32 = v.parse().map_err(|_| {
                IdentityError::invalid_node_id(part, "invalid numeric identifier")
            })?;
            Ok(Self::Numeric(value))
        } else if let Some(v) = part.strip_prefix("s=") {
            Ok(Self::String(v.to_string()))
        } else if let Some(v) = part.strip_prefix("g=") {
            let uuid = Uuid::parse_str(v)
                .map_err(|e| IdentityError::invalid_node_id(part, format!("invalid GUID: {e}")))?;
            Ok(Self::Guid(uuid))
        } else if let Some(v) = part.strip_prefix("b=") {
            let bytes = BASE64.decode(v).map_err(|e| {
                IdentityError::invalid_node_id(part, format!("invalid base64: {e}"))
            })?;
            Ok(Self::Opaque(bytes))
        } else {
            Err(IdentityError::invalid_node_id(
                part,
                "expected identifier prefix i=, s=, g=, or b=",
            ))
        }
    }

    /// Returns `true` if the stringified forms match case-insensitively.
    pub fn matches_text(&self, other: &Identifier) -> bool {
        self.to_string().eq_ignore_ascii_case(&other.to_string())
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(v) => write!(f, "i={}", v),
            Self::String(v) => write!(f, "s={}", v),
            Self::Guid(v) => write!(f, "g={}", v),
            Self::Opaque(v) => write!(f, "b={}", BASE64.encode(v)),
        }
    }
}

// =============================================================================
// UaNodeId
// =============================================================================

/// Concrete node identity: namespace index plus identifier.
///
/// Only meaningful within one server, since namespace indexes are a
/// per-server artifact of its namespace table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UaNodeId {
    /// Namespace index (0 = OPC UA standard namespace).
    pub namespace_index: u16,

    /// The identifier.
    pub identifier: Identifier,
}

impl UaNodeId {
    /// Creates a numeric node id.
    #[inline]
    pub fn numeric(namespace_index: u16, value: u32) -> Self {
        Self {
            namespace_index,
            identifier: Identifier::Numeric(value),
        }
    }

    /// Creates a string node id.
    #[inline]
    pub fn string(namespace_index: u16, value: impl Into<String>) -> Self {
        Self {
            namespace_index,
            identifier: Identifier::String(value.into()),
        }
    }
}

impl fmt::Display for UaNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace_index == 0 {
            write!(f, "{}", self.identifier)
        } else {
            write!(f, "ns={};{}", self.namespace_index, self.identifier)
        }
    }
}

impl FromStr for UaNodeId {
    type Err = IdentityError;

    /// Parses `ns=2;i=1001`, `ns=2;s=Line1.Speed`, or the namespace-0
    /// shorthand `i=85`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (namespace_index, identifier_part) = match s.strip_prefix("ns=") {
            Some(rest) => {
                let (ns_str, ident) = rest.split_once(';').ok_or_else(|| {
                    IdentityError::invalid_node_id(s, "missing identifier after namespace")
                })?;
                let ns: u16 = ns_str.parse().map_err(|_| {
                    IdentityError::invalid_node_id(s, "invalid namespace index")
                })?;
                (ns, ident)
            }
            None => (0, s),
        };

        Ok(Self {
            namespace_index,
            identifier: Identifier::parse_part(identifier_part)?,
        })
    }
}

// =============================================================================
// UaExpandedNodeId
// =============================================================================

/// Portable node identity: namespace URI plus identifier.
///
/// The namespace index is a cache filled in once the owning session has
/// read the server's namespace table; `None` means "not resolved yet".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UaExpandedNodeId {
    /// Namespace URI.
    pub namespace_uri: String,

    /// The identifier.
    pub identifier: Identifier,

    /// Concrete namespace index, once resolved against a server.
    pub namespace_index: Option<u16>,
}

impl UaExpandedNodeId {
    /// Creates an unresolved expanded node id.
    pub fn new(namespace_uri: impl Into<String>, identifier: Identifier) -> Self {
        Self {
            namespace_uri: namespace_uri.into(),
            identifier,
            namespace_index: None,
        }
    }

    /// Returns the concrete node id if the namespace index is resolved.
    pub fn to_node_id(&self) -> Option<UaNodeId> {
        self.namespace_index.map(|ns| UaNodeId {
            namespace_index: ns,
            identifier: self.identifier.clone(),
        })
    }
}

impl fmt::Display for UaExpandedNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "nsu={};{}", self.namespace_uri, self.identifier)
    }
}

impl FromStr for UaExpandedNodeId {
    type Err = IdentityError;

    /// Parses `nsu=<uri>;i=1001` (and the `s=`/`g=`/`b=` variants).
    ///
    /// The identifier marker is located from the right so URIs containing
    /// semicolons keep working.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let rest = s.strip_prefix("nsu=").ok_or_else(|| {
            IdentityError::invalid_node_id(s, "expected nsu= prefix")
        })?;

        let split = [";i=", ";s=", ";g=", ";b="]
            .iter()
            .filter_map(|marker| rest.rfind(marker))
            .max()
            .ok_or_else(|| {
                IdentityError::invalid_node_id(s, "missing identifier after namespace URI")
            })?;

        let uri = &rest[..split];
        if uri.is_empty() {
            return Err(IdentityError::invalid_node_id(s, "empty namespace URI"));
        }

        Ok(Self {
            namespace_uri: uri.to_string(),
            identifier: Identifier::parse_part(&rest[split + 1..])?,
            namespace_index: None,
        })
    }
}

// =============================================================================
// NodeIdentity
// =============================================================================

/// A node identity in exactly one of the two OPC UA forms.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "form")]
pub enum NodeIdentity {
    /// Concrete `(namespace index, identifier)` form.
    Node(UaNodeId),

    /// Portable `(namespace URI, identifier)` form.
    Expanded(UaExpandedNodeId),
}

impl NodeIdentity {
    /// Returns the identifier regardless of form.
    pub fn identifier(&self) -> &Identifier {
        match self {
            Self::Node(n) => &n.identifier,
            Self::Expanded(e) => &e.identifier,
        }
    }

    /// Returns `true` for the portable, URI-based form.
    pub fn is_expanded(&self) -> bool {
        matches!(self, Self::Expanded(_))
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node(n) => write!(f, "{}", n),
            Self::Expanded(e) => write!(f, "{}", e),
        }
    }
}

impl FromStr for NodeIdentity {
    type Err = IdentityError;

    /// `nsu=...` parses as the expanded form, everything else as the
    /// concrete form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim_start().starts_with("nsu=") {
            Ok(Self::Expanded(s.parse()?))
        } else {
            Ok(Self::Node(s.parse()?))
        }
    }
}

impl From<UaNodeId> for NodeIdentity {
    fn from(node: UaNodeId) -> Self {
        Self::Node(node)
    }
}

impl From<UaExpandedNodeId> for NodeIdentity {
    fn from(expanded: UaExpandedNodeId) -> Self {
        Self::Expanded(expanded)
    }
}

// =============================================================================
// NamespaceTable
// =============================================================================

/// The server's ordered namespace URI array.
///
/// Populated once per successful connect and treated as stable until the
/// session reconnects. URI lookups are case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct NamespaceTable {
    uris: Vec<String>,
}

impl NamespaceTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the table contents with a freshly read namespace array.
    pub fn populate(&mut self, uris: Vec<String>) {
        self.uris = uris;
    }

    /// Returns the URI at the given namespace index.
    pub fn uri(&self, index: u16) -> Option<&str> {
        self.uris
            .get(index as usize)
            .map(String::as_str)
            .filter(|u| !u.is_empty())
    }

    /// Returns the index of the given URI, compared case-insensitively.
    pub fn index_of(&self, uri: &str) -> Option<u16> {
        self.uris
            .iter()
            .position(|u| u.eq_ignore_ascii_case(uri))
            .map(|i| i as u16)
    }

    /// Returns `true` if the table has been populated.
    pub fn is_populated(&self) -> bool {
        !self.uris.is_empty()
    }

    /// Number of namespaces in the table.
    pub fn len(&self) -> usize {
        self.uris.len()
    }

    /// Returns `true` if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.uris.is_empty()
    }
}

// =============================================================================
// StatusCode
// =============================================================================

/// OPC UA service result code.
///
/// The top two bits carry the severity; the engine only distinguishes
/// good / uncertain / bad plus the handful of codes it reacts to by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusCode(pub u32);

impl StatusCode {
    /// Operation succeeded.
    pub const GOOD: StatusCode = StatusCode(0x0000_0000);
    /// Unspecified failure.
    pub const BAD_UNEXPECTED_ERROR: StatusCode = StatusCode(0x8001_0000);
    /// Low-level communication failure.
    pub const BAD_COMMUNICATION_ERROR: StatusCode = StatusCode(0x8005_0000);
    /// The operation timed out.
    pub const BAD_TIMEOUT: StatusCode = StatusCode(0x800A_0000);
    /// The session id is not valid (session died server-side).
    pub const BAD_SESSION_ID_INVALID: StatusCode = StatusCode(0x8025_0000);
    /// The session was closed by the client.
    pub const BAD_SESSION_CLOSED: StatusCode = StatusCode(0x8026_0000);
    /// No communication with the data source.
    pub const BAD_NO_COMMUNICATION: StatusCode = StatusCode(0x8031_0000);
    /// The node id is syntactically invalid for the server.
    pub const BAD_NODE_ID_INVALID: StatusCode = StatusCode(0x8033_0000);
    /// The node id refers to a node that does not exist.
    pub const BAD_NODE_ID_UNKNOWN: StatusCode = StatusCode(0x8034_0000);
    /// The server has reached its monitored item capacity.
    pub const BAD_TOO_MANY_MONITORED_ITEMS: StatusCode = StatusCode(0x80DB_0000);
    /// The transport connection was closed.
    pub const BAD_CONNECTION_CLOSED: StatusCode = StatusCode(0x80AE_0000);

    const SEVERITY_BAD: u32 = 0x8000_0000;
    const SEVERITY_UNCERTAIN: u32 = 0x4000_0000;

    /// Returns `true` if the severity is bad.
    #[inline]
    pub const fn is_bad(&self) -> bool {
        self.0 & Self::SEVERITY_BAD != 0
    }

    /// Returns `true` if the severity is uncertain.
    #[inline]
    pub const fn is_uncertain(&self) -> bool {
        self.0 & Self::SEVERITY_UNCERTAIN != 0 && !self.is_bad()
    }

    /// Returns `true` if the severity is neither bad nor uncertain.
    #[inline]
    pub const fn is_good(&self) -> bool {
        !self.is_bad() && !self.is_uncertain()
    }

    /// Returns the symbolic name for codes the engine knows by name.
    pub fn name(&self) -> Option<&'static str> {
        match *self {
            Self::GOOD => Some("Good"),
            Self::BAD_UNEXPECTED_ERROR => Some("BadUnexpectedError"),
            Self::BAD_COMMUNICATION_ERROR => Some("BadCommunicationError"),
            Self::BAD_TIMEOUT => Some("BadTimeout"),
            Self::BAD_SESSION_ID_INVALID => Some("BadSessionIdInvalid"),
            Self::BAD_SESSION_CLOSED => Some("BadSessionClosed"),
            Self::BAD_NO_COMMUNICATION => Some("BadNoCommunication"),
            Self::BAD_NODE_ID_INVALID => Some("BadNodeIdInvalid"),
            Self::BAD_NODE_ID_UNKNOWN => Some("BadNodeIdUnknown"),
            Self::BAD_TOO_MANY_MONITORED_ITEMS => Some("BadTooManyMonitoredItems"),
            Self::BAD_CONNECTION_CLOSED => Some("BadConnectionClosed"),
            _ => None,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "0x{:08X}", self.0),
        }
    }
}

impl Default for StatusCode {
    fn default() -> Self {
        Self::GOOD
    }
}

// =============================================================================
// UaValue
// =============================================================================

/// A value carried by a data-change notification.
#[derive(Debug, Clone, PartialEq)]
pub enum UaValue {
    /// Boolean.
    Boolean(bool),
    /// Signed 8-bit integer.
    SByte(i8),
    /// Unsigned 8-bit integer.
    Byte(u8),
    /// Signed 16-bit integer.
    Int16(i16),
    /// Unsigned 16-bit integer.
    UInt16(u16),
    /// Signed 32-bit integer.
    Int32(i32),
    /// Unsigned 32-bit integer.
    UInt32(u32),
    /// Signed 64-bit integer.
    Int64(i64),
    /// Unsigned 64-bit integer.
    UInt64(u64),
    /// 32-bit float.
    Float(f32),
    /// 64-bit double.
    Double(f64),
    /// UTF-8 string.
    String(String),
    /// Date/time.
    DateTime(DateTime<Utc>),
    /// GUID.
    Guid(Uuid),
    /// Raw bytes.
    ByteString(Vec<u8>),
    /// Array of values.
    Array(Vec<UaValue>),
    /// No value.
    Null,
}

impl UaValue {
    /// Encodes the value as plain JSON for the egress envelope.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::{json, Value};
        match self {
            Self::Boolean(v) => json!(v),
            Self::SByte(v) => json!(v),
            Self::Byte(v) => json!(v),
            Self::Int16(v) => json!(v),
            Self::UInt16(v) => json!(v),
            Self::Int32(v) => json!(v),
            Self::UInt32(v) => json!(v),
            Self::Int64(v) => json!(v),
            Self::UInt64(v) => json!(v),
            Self::Float(v) => json!(v),
            Self::Double(v) => json!(v),
            Self::String(v) => json!(v),
            Self::DateTime(v) => json!(v.to_rfc3339()),
            Self::Guid(v) => json!(v.to_string()),
            Self::ByteString(v) => json!(BASE64.encode(v)),
            Self::Array(values) => Value::Array(values.iter().map(UaValue::to_json).collect()),
            Self::Null => Value::Null,
        }
    }
}

impl Default for UaValue {
    fn default() -> Self {
        Self::Null
    }
}

// =============================================================================
// DataValue
// =============================================================================

/// An attribute value with its status and timestamps.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataValue {
    /// The value, absent when the read failed.
    pub value: Option<UaValue>,

    /// Status of the value.
    pub status: StatusCode,

    /// Timestamp applied by the underlying data source.
    pub source_timestamp: Option<DateTime<Utc>>,

    /// Timestamp applied by the server.
    pub server_timestamp: Option<DateTime<Utc>>,
}

impl DataValue {
    /// Creates a good data value without timestamps.
    pub fn new(value: UaValue) -> Self {
        Self {
            value: Some(value),
            status: StatusCode::GOOD,
            source_timestamp: None,
            server_timestamp: None,
        }
    }

    /// Sets the source timestamp.
    pub fn with_source_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.source_timestamp = Some(ts);
        self
    }

    /// Sets the server timestamp.
    pub fn with_server_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.server_timestamp = Some(ts);
        self
    }
}

// =============================================================================
// MonitoringMode / AttributeId
// =============================================================================

/// Monitoring mode requested for a monitored item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitoringMode {
    /// Item exists but neither samples nor reports.
    Disabled,
    /// Item samples but queues nothing for publishing.
    Sampling,
    /// Item samples and reports value changes.
    #[default]
    Reporting,
}

/// Node attributes the engine reads or monitors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeId {
    /// The DisplayName attribute.
    DisplayName,
    /// The Value attribute.
    #[default]
    Value,
}

impl AttributeId {
    /// OPC UA numeric attribute id.
    pub const fn value(&self) -> u32 {
        match self {
            Self::DisplayName => 4,
            Self::Value => 13,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
