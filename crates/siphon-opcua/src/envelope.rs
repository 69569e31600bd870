// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! The egress envelope.
//!
//! Every value-change notification becomes one JSON object with the
//! fields `ApplicationUri`, `DisplayName`, `NodeId`, `Value`, in that
//! order. The `Value` member is the OPC DataValue with its
//! `ServerTimestamp` pinned to the epoch sentinel so the envelope is
//! deterministic regardless of when the server stamped the sample.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::DataValue;

/// Sentinel written into `Value.ServerTimestamp` on every envelope.
pub fn epoch_sentinel() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

// =============================================================================
// EnvelopeContext
// =============================================================================

/// Per-session context baked into every envelope.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeContext {
    /// The server's application URI, read at connect time.
    pub application_uri: String,

    /// Optional shopfloor domain appended to the application URI.
    pub shopfloor_domain: Option<String>,
}

impl EnvelopeContext {
    /// The `ApplicationUri` field value: the server application URI,
    /// suffixed with `:{domain}` when a non-empty shopfloor domain is
    /// configured. The `:` join is part of the wire contract.
    pub fn qualified_application_uri(&self) -> String {
        match self.shopfloor_domain.as_deref() {
            Some(domain) if !domain.is_empty() => {
                format!("{}:{}", self.application_uri, domain)
            }
            _ => self.application_uri.clone(),
        }
    }
}

// =============================================================================
// TelemetryEnvelope
// =============================================================================

/// The wire shape of one published value change.
#[derive(Debug, Serialize)]
pub struct TelemetryEnvelope {
    /// Source server application URI (possibly domain-qualified).
    #[serde(rename = "ApplicationUri")]
    pub application_uri: String,

    /// Display name of the monitored node.
    #[serde(rename = "DisplayName")]
    pub display_name: String,

    /// The node identity in whichever form the item is configured with.
    #[serde(rename = "NodeId")]
    pub node_id: String,

    /// The sampled value.
    #[serde(rename = "Value")]
    pub value: WireDataValue,
}

impl TelemetryEnvelope {
    /// Builds an envelope from a notification.
    pub fn new(
        ctx: &EnvelopeContext,
        display_name: impl Into<String>,
        node_id: impl Into<String>,
        data: &DataValue,
    ) -> Self {
        Self {
            application_uri: ctx.qualified_application_uri(),
            display_name: display_name.into(),
            node_id: node_id.into(),
            value: WireDataValue::from_data_value(data),
        }
    }

    /// Serializes the envelope to its JSON string form.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// =============================================================================
// WireDataValue
// =============================================================================

/// Wire shape of the `Value` member.
#[derive(Debug, Serialize)]
pub struct WireDataValue {
    /// The value itself, omitted when the notification carried none.
    #[serde(rename = "Value", skip_serializing_if = "serde_json::Value::is_null")]
    pub value: serde_json::Value,

    /// Status code, omitted when good.
    #[serde(rename = "StatusCode", skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u32>,

    /// Source timestamp, omitted when the server supplied none.
    #[serde(rename = "SourceTimestamp", skip_serializing_if = "Option::is_none")]
    pub source_timestamp: Option<DateTime<Utc>>,

    /// Always the epoch sentinel.
    #[serde(rename = "ServerTimestamp")]
    pub server_timestamp: DateTime<Utc>,
}

impl WireDataValue {
    /// Converts a [`DataValue`], clearing the server timestamp.
    pub fn from_data_value(data: &DataValue) -> Self {
        Self {
            value: data
                .value
                .as_ref()
                .map(|v| v.to_json())
                .unwrap_or(serde_json::Value::Null),
            status_code: (!data.status.is_good()).then_some(data.status.0),
            source_timestamp: data.source_timestamp,
            server_timestamp: epoch_sentinel(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{StatusCode, UaValue};
    use chrono::TimeZone;

    #[test]
    fn field_order_is_fixed() {
        let ctx = EnvelopeContext {
            application_uri: "urn:server".into(),
            shopfloor_domain: None,
        };
        let data = DataValue::new(UaValue::Double(1.5));
        let json = TelemetryEnvelope::new(&ctx, "Speed", "ns=2;i=7", &data)
            .encode()
            .unwrap();

        let app = json.find("\"ApplicationUri\"").unwrap();
        let name = json.find("\"DisplayName\"").unwrap();
        let node = json.find("\"NodeId\"").unwrap();
        let value = json.find("\"Value\"").unwrap();
        assert!(app < name && name < node && node < value);
    }

    #[test]
    fn shopfloor_domain_is_colon_joined() {
        let ctx = EnvelopeContext {
            application_uri: "urn:server".into(),
            shopfloor_domain: Some("hall7".into()),
        };
        assert_eq!(ctx.qualified_application_uri(), "urn:server:hall7");

        let empty = EnvelopeContext {
            application_uri: "urn:server".into(),
            shopfloor_domain: Some(String::new()),
        };
        assert_eq!(empty.qualified_application_uri(), "urn:server");
    }

    #[test]
    fn server_timestamp_is_epoch() {
        let sampled_at = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let data = DataValue::new(UaValue::Int32(42))
            .with_source_timestamp(sampled_at)
            .with_server_timestamp(sampled_at);

        let wire = WireDataValue::from_data_value(&data);
        assert_eq!(wire.server_timestamp, epoch_sentinel());
        assert_eq!(wire.source_timestamp, Some(sampled_at));
    }

    #[test]
    fn bad_status_is_emitted_good_is_omitted() {
        let good = WireDataValue::from_data_value(&DataValue::new(UaValue::Int32(1)));
        assert_eq!(good.status_code, None);

        let bad = WireDataValue::from_data_value(&DataValue {
            value: Some(UaValue::Int32(1)),
            status: StatusCode::BAD_NO_COMMUNICATION,
            source_timestamp: None,
            server_timestamp: None,
        });
        assert_eq!(bad.status_code, Some(StatusCode::BAD_NO_COMMUNICATION.0));
    }
}
