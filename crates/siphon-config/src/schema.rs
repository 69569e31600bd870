// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Serde model of the published-nodes file.
//!
//! The file is a JSON array of entries. Each entry names an endpoint and
//! either a single legacy node (default intervals) or a list of nodes with
//! optional per-node sampling and publishing intervals:
//!
//! ```json
//! [
//!   {
//!     "EndpointUrl": "opc.tcp://host:4840/path",
//!     "OpcNodes": [
//!       {
//!         "ExpandedNodeId": "nsu=urn:factory:line1;i=42",
//!         "OpcSamplingInterval": 1000,
//!         "OpcPublishingInterval": 1000
//!       }
//!     ]
//!   },
//!   {
//!     "EndpointUrl": "opc.tcp://legacy:4840",
//!     "NodeId": { "Identifier": "ns=2;i=1001" }
//!   }
//! ]
//! ```
//!
//! The `ExpandedNodeId` field carries the node identity in whichever
//! string form it currently has: `nsu=...` for a namespace-URI identity
//! or `ns=...` for a concrete namespace-index identity. Rewrites of the
//! file preserve the stored form. Optional fields are omitted on emit.

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Sampling interval applied when an entry does not specify one.
pub const DEFAULT_SAMPLING_INTERVAL_MS: u64 = 1000;

/// Publishing interval applied when an entry does not specify one.
pub const DEFAULT_PUBLISHING_INTERVAL_MS: u64 = 1000;

// =============================================================================
// PublishedNodesEntry
// =============================================================================

/// One entry of the published-nodes file.
///
/// Exactly one of `node_id` (legacy single-node shape) or `opc_nodes`
/// must be present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedNodesEntry {
    /// OPC UA server endpoint URL.
    #[serde(rename = "EndpointUrl")]
    pub endpoint_url: String,

    /// Legacy single-node shape with default intervals.
    #[serde(rename = "NodeId", default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<LegacyNodeId>,

    /// Preferred multi-node shape.
    #[serde(rename = "OpcNodes", default, skip_serializing_if = "Option::is_none")]
    pub opc_nodes: Option<Vec<OpcNodeEntry>>,
}

impl PublishedNodesEntry {
    /// Creates an entry in the preferred `OpcNodes` shape.
    pub fn with_nodes(endpoint_url: impl Into<String>, nodes: Vec<OpcNodeEntry>) -> Self {
        Self {
            endpoint_url: endpoint_url.into(),
            node_id: None,
            opc_nodes: Some(nodes),
        }
    }

    /// Checks the entry against the schema rules.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.endpoint_url.trim().is_empty() {
            return Err(ConfigError::invalid_entry(
                &self.endpoint_url,
                "EndpointUrl must not be empty",
            ));
        }
        match (&self.node_id, &self.opc_nodes) {
            (Some(_), Some(_)) => Err(ConfigError::invalid_entry(
                &self.endpoint_url,
                "NodeId and OpcNodes are mutually exclusive",
            )),
            (None, None) => Err(ConfigError::invalid_entry(
                &self.endpoint_url,
                "one of NodeId or OpcNodes is required",
            )),
            _ => Ok(()),
        }
    }

    /// Flattens the entry into `(identity string, sampling, publishing)`
    /// tuples with defaults applied.
    pub fn nodes(&self) -> Vec<(String, u64, u64)> {
        match (&self.node_id, &self.opc_nodes) {
            (Some(legacy), _) => vec![(
                legacy.identifier.clone(),
                DEFAULT_SAMPLING_INTERVAL_MS,
                DEFAULT_PUBLISHING_INTERVAL_MS,
            )],
            (None, Some(nodes)) => nodes
                .iter()
                .map(|n| {
                    (
                        n.expanded_node_id.clone(),
                        n.sampling_interval_ms(),
                        n.publishing_interval_ms(),
                    )
                })
                .collect(),
            (None, None) => Vec::new(),
        }
    }
}

// =============================================================================
// LegacyNodeId
// =============================================================================

/// Legacy node reference: a single identifier string in `ns=...` form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyNodeId {
    /// Node identifier, e.g. `ns=2;i=1001`.
    #[serde(rename = "Identifier")]
    pub identifier: String,
}

// =============================================================================
// OpcNodeEntry
// =============================================================================

/// A node within an `OpcNodes` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpcNodeEntry {
    /// Node identity string, `nsu=...` or `ns=...` form.
    #[serde(rename = "ExpandedNodeId")]
    pub expanded_node_id: String,

    /// Per-node sampling interval in milliseconds.
    #[serde(
        rename = "OpcSamplingInterval",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub opc_sampling_interval: Option<u64>,

    /// Per-node publishing interval in milliseconds.
    #[serde(
        rename = "OpcPublishingInterval",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub opc_publishing_interval: Option<u64>,
}

impl OpcNodeEntry {
    /// Creates a node entry with explicit intervals.
    pub fn new(
        expanded_node_id: impl Into<String>,
        sampling_ms: Option<u64>,
        publishing_ms: Option<u64>,
    ) -> Self {
        Self {
            expanded_node_id: expanded_node_id.into(),
            opc_sampling_interval: sampling_ms,
            opc_publishing_interval: publishing_ms,
        }
    }

    /// Effective sampling interval with the default applied.
    pub fn sampling_interval_ms(&self) -> u64 {
        self.opc_sampling_interval
            .unwrap_or(DEFAULT_SAMPLING_INTERVAL_MS)
    }

    /// Effective publishing interval with the default applied.
    pub fn publishing_interval_ms(&self) -> u64 {
        self.opc_publishing_interval
            .unwrap_or(DEFAULT_PUBLISHING_INTERVAL_MS)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_preferred_shape() {
        let json = r#"[
            {
                "EndpointUrl": "opc.tcp://host:4840",
                "OpcNodes": [
                    { "ExpandedNodeId": "nsu=urn:x;i=7", "OpcSamplingInterval": 500 }
                ]
            }
        ]"#;

        let entries: Vec<PublishedNodesEntry> = serde_json::from_str(json).unwrap();
        assert_eq!(entries.len(), 1);
        entries[0].validate().unwrap();

        let nodes = entries[0].nodes();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].0, "nsu=urn:x;i=7");
        assert_eq!(nodes[0].1, 500);
        assert_eq!(nodes[0].2, DEFAULT_PUBLISHING_INTERVAL_MS);
    }

    #[test]
    fn parse_legacy_shape() {
        let json = r#"[
            { "EndpointUrl": "opc.tcp://host:4840", "NodeId": { "Identifier": "ns=2;i=1001" } }
        ]"#;

        let entries: Vec<PublishedNodesEntry> = serde_json::from_str(json).unwrap();
        entries[0].validate().unwrap();

        let nodes = entries[0].nodes();
        assert_eq!(
            nodes,
            vec![(
                "ns=2;i=1001".to_string(),
                DEFAULT_SAMPLING_INTERVAL_MS,
                DEFAULT_PUBLISHING_INTERVAL_MS
            )]
        );
    }

    #[test]
    fn reject_both_shapes() {
        let entry = PublishedNodesEntry {
            endpoint_url: "opc.tcp://host:4840".to_string(),
            node_id: Some(LegacyNodeId {
                identifier: "ns=2;i=1".to_string(),
            }),
            opc_nodes: Some(vec![]),
        };
        assert!(entry.validate().is_err());
    }

    #[test]
    fn reject_empty_entry() {
        let entry = PublishedNodesEntry {
            endpoint_url: "opc.tcp://host:4840".to_string(),
            node_id: None,
            opc_nodes: None,
        };
        assert!(entry.validate().is_err());
    }

    #[test]
    fn optional_intervals_omitted_on_emit() {
        let entry = PublishedNodesEntry::with_nodes(
            "opc.tcp://host:4840",
            vec![OpcNodeEntry::new("ns=2;i=1001", None, None)],
        );
        let json = serde_json::to_string(&vec![entry]).unwrap();
        assert!(!json.contains("OpcSamplingInterval"));
        assert!(!json.contains("OpcPublishingInterval"));
        assert!(!json.contains("NodeId"));
    }
}
