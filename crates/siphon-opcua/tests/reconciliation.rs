// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! End-to-end reconciliation tests against the recording mock
//! transport: startup, namespace resolution, idempotent adds, removal
//! and re-add, keep-alive failure, persistence round-trips.

mod common;

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;

use common::MockTransport;
use siphon_config::{ConfigFile, OpcNodeEntry, PublishedNodesEntry};
use siphon_egress::MemoryQueue;
use siphon_opcua::{
    DataValue, MonitorState, NodeIdentity, PublisherSettings, SessionRegistry, SessionState,
    ShutdownToken, StatusCode, UaValue,
};

const EP_A: &str = "opc.tcp://factory-a:4840";
const EP_B: &str = "opc.tcp://factory-b:4840";

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    transport: Arc<MockTransport>,
    registry: Arc<SessionRegistry<MockTransport>>,
    egress: mpsc::UnboundedReceiver<String>,
    shutdown: ShutdownToken,
    config_path: PathBuf,
    _dir: TempDir,
}

fn entry(endpoint: &str, nodes: &[(&str, Option<u64>, Option<u64>)]) -> PublishedNodesEntry {
    PublishedNodesEntry::with_nodes(
        endpoint,
        nodes
            .iter()
            .map(|(node, sampling, publishing)| OpcNodeEntry::new(*node, *sampling, *publishing))
            .collect(),
    )
}

fn build_harness(entries: &[PublishedNodesEntry], settings: PublisherSettings) -> Harness {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("publishednodes.json");
    let config = ConfigFile::new(&config_path);
    config.write_entries(entries).unwrap();

    let transport = Arc::new(MockTransport::new());
    let (queue, egress) = MemoryQueue::new();
    let shutdown = ShutdownToken::new();
    let registry = SessionRegistry::new(
        Arc::clone(&transport),
        queue,
        settings,
        config,
        shutdown.clone(),
    );

    Harness {
        transport,
        registry,
        egress,
        shutdown,
        config_path,
        _dir: dir,
    }
}

fn harness(entries: &[PublishedNodesEntry]) -> Harness {
    build_harness(entries, PublisherSettings::default())
}

fn identity(s: &str) -> NodeIdentity {
    s.parse().unwrap()
}

async fn node_state(
    registry: &SessionRegistry<MockTransport>,
    endpoint: &str,
    node: &str,
) -> Option<MonitorState> {
    let session = registry.session(endpoint).await?;
    let query = identity(node);
    session
        .item_states()
        .await
        .into_iter()
        .find(|(id, _)| {
            // Concrete queries also match upgraded portable identities
            // through their cached index.
            id.to_string().eq_ignore_ascii_case(node)
                || matches!(
                    (id, &query),
                    (NodeIdentity::Expanded(e), NodeIdentity::Node(n))
                        if e.namespace_index == Some(n.namespace_index)
                            && e.identifier.to_string()
                                .eq_ignore_ascii_case(&n.identifier.to_string())
                )
        })
        .map(|(_, state)| state)
}

/// Polls an async condition for up to two seconds.
macro_rules! eventually {
    ($cond:expr) => {{
        let mut ok = false;
        for _ in 0..200 {
            if $cond {
                ok = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(ok, "condition not reached within 2s: {}", stringify!($cond));
    }};
}

// =============================================================================
// Startup scenarios
// =============================================================================

#[tokio::test]
async fn startup_two_endpoints_reach_monitored() {
    let h = harness(&[
        entry(EP_A, &[("ns=1;i=1001", Some(500), Some(1000))]),
        entry(EP_B, &[("ns=1;i=2002", Some(1000), Some(2000))]),
    ]);

    assert_eq!(h.registry.bootstrap().await.unwrap(), 2);
    assert_eq!(h.registry.session_count().await, 2);

    h.registry.reconcile_once().await;

    for (endpoint, node) in [(EP_A, "ns=1;i=1001"), (EP_B, "ns=1;i=2002")] {
        let session = h.registry.session(endpoint).await.unwrap();
        assert_eq!(session.state().await, SessionState::Connected);
        assert_eq!(session.subscription_count().await, 1);
        assert_eq!(
            node_state(&h.registry, endpoint, node).await,
            Some(MonitorState::Monitored)
        );
    }

    assert_eq!(h.transport.connects.load(Ordering::SeqCst), 2);
    assert_eq!(h.transport.item_creates.load(Ordering::SeqCst), 2);
    assert_eq!(h.transport.live_subscription_intervals(EP_A), vec![1000]);
    assert_eq!(h.transport.live_subscription_intervals(EP_B), vec![2000]);
}

#[tokio::test]
async fn namespace_uri_is_resolved_after_connect() {
    let h = harness(&[entry(EP_A, &[("nsu=urn:x;i=7", None, None)])]);
    h.transport.set_namespaces(
        EP_A,
        vec![
            "http://opcfoundation.org/UA/".into(),
            "urn:a".into(),
            "urn:b".into(),
            "urn:x".into(),
        ],
    );

    h.registry.bootstrap().await.unwrap();

    // Before connect the item waits for namespace reconciliation.
    let session = h.registry.session(EP_A).await.unwrap();
    assert_eq!(
        session.item_states().await[0].1,
        MonitorState::NamespaceUpdateRequested
    );

    h.registry.reconcile_once().await;

    let (id, state) = session.item_states().await.remove(0);
    assert_eq!(state, MonitorState::Monitored);
    match id {
        NodeIdentity::Expanded(e) => assert_eq!(e.namespace_index, Some(3)),
        other => panic!("expected expanded identity, got {other:?}"),
    }

    // The effective node id sent to the server uses the resolved index.
    assert_eq!(
        h.transport.created_nodes.lock().unwrap().as_slice(),
        ["ns=3;i=7"]
    );
}

#[tokio::test]
async fn unresolvable_namespace_stays_pending() {
    let h = harness(&[entry(EP_A, &[("nsu=urn:absent;i=7", None, None)])]);

    h.registry.bootstrap().await.unwrap();
    h.registry.reconcile_once().await;
    h.registry.reconcile_once().await;

    let session = h.registry.session(EP_A).await.unwrap();
    assert_eq!(session.state().await, SessionState::Connected);
    assert_eq!(
        session.item_states().await[0].1,
        MonitorState::NamespaceUpdateRequested
    );
    assert_eq!(h.transport.item_creates.load(Ordering::SeqCst), 0);
}

// =============================================================================
// Mutators
// =============================================================================

#[tokio::test]
async fn duplicate_add_creates_one_item() {
    let h = harness(&[]);
    h.registry.bootstrap().await.unwrap();

    let added_first = h
        .registry
        .add_node(EP_A, identity("ns=1;i=5"), None, None)
        .await
        .unwrap();
    let added_second = h
        .registry
        .add_node(EP_A, identity("ns=1;i=5"), None, None)
        .await
        .unwrap();

    assert!(added_first);
    assert!(!added_second);

    h.registry.reconcile_once().await;

    let session = h.registry.session(EP_A).await.unwrap();
    assert_eq!(session.item_states().await.len(), 1);
    assert_eq!(h.transport.item_creates.load(Ordering::SeqCst), 1);

    // Still published, still a no-op on re-add after the tick.
    assert!(h.registry.is_node_published(EP_A, &identity("ns=1;i=5")).await);
    assert!(!h
        .registry
        .add_node(EP_A, identity("ns=1;i=5"), None, None)
        .await
        .unwrap());
}

#[tokio::test]
async fn cross_form_queries_find_published_node() {
    let h = harness(&[entry(EP_A, &[("ns=1;i=5", None, None)])]);
    h.registry.bootstrap().await.unwrap();
    h.registry.reconcile_once().await;

    // The default mock table maps index 1 to urn:mock:ns1.
    assert!(h.registry.is_node_published(EP_A, &identity("ns=1;i=5")).await);
    assert!(
        h.registry
            .is_node_published(EP_A, &identity("nsu=urn:mock:ns1;i=5"))
            .await
    );
    assert!(
        h.registry
            .is_node_published_anywhere(&identity("nsu=URN:MOCK:NS1;i=5"))
            .await
    );
    assert!(
        !h.registry
            .is_node_published(EP_A, &identity("nsu=urn:mock:ns2;i=5"))
            .await
    );
}

#[tokio::test]
async fn removal_then_re_add_creates_fresh_item() {
    // Two nodes so the session survives the removal.
    let h = harness(&[entry(
        EP_A,
        &[("ns=1;i=5", None, None), ("ns=1;i=6", None, None)],
    )]);
    h.registry.bootstrap().await.unwrap();
    h.registry.reconcile_once().await;
    assert_eq!(h.transport.live_item_count(EP_A), 2);

    let tagged = h
        .registry
        .remove_node(Some(EP_A), &identity("ns=1;i=5"))
        .await
        .unwrap();
    assert_eq!(tagged, 1);

    // Tagged items are invisible to publish queries even before the
    // reconciliation pass drops them.
    assert!(!h.registry.is_node_published(EP_A, &identity("ns=1;i=5")).await);

    h.registry.reconcile_once().await;
    assert_eq!(h.transport.live_item_count(EP_A), 1);
    assert_eq!(h.transport.removed_items.lock().unwrap().len(), 1);

    // Re-adding produces a fresh server-side item.
    h.registry
        .add_node(EP_A, identity("ns=1;i=5"), None, None)
        .await
        .unwrap();
    h.registry.reconcile_once().await;

    assert_eq!(h.transport.live_item_count(EP_A), 2);
    assert_eq!(h.transport.item_creates.load(Ordering::SeqCst), 3);
    assert!(h.registry.is_node_published(EP_A, &identity("ns=1;i=5")).await);
}

#[tokio::test]
async fn mutators_are_inert_after_shutdown_request() {
    let h = harness(&[entry(EP_A, &[("ns=1;i=5", None, None)])]);
    h.registry.bootstrap().await.unwrap();
    h.registry.reconcile_once().await;

    h.shutdown.request_shutdown();

    assert!(!h
        .registry
        .add_node(EP_A, identity("ns=1;i=9"), None, None)
        .await
        .unwrap());
    assert_eq!(
        h.registry
            .remove_node(Some(EP_A), &identity("ns=1;i=5"))
            .await
            .unwrap(),
        0
    );
}

// =============================================================================
// Fault handling
// =============================================================================

#[tokio::test]
async fn connect_backoff_grows_linearly_and_caps() {
    let h = harness(&[entry(EP_A, &[("ns=1;i=5", None, None)])]);
    h.registry.bootstrap().await.unwrap();

    h.transport.fail_all_connects(true);
    for _ in 0..7 {
        h.registry.reconcile_once().await;
    }

    let session = h.registry.session(EP_A).await.unwrap();
    assert_eq!(session.state().await, SessionState::Disconnected);
    assert_eq!(session.unsuccessful_connects().await, 7);

    // session_timeout_ms = 10_000; linear growth capped at 5x.
    let timeouts = h.transport.connect_timeouts.lock().unwrap().clone();
    assert_eq!(
        timeouts,
        vec![10_000, 20_000, 30_000, 40_000, 50_000, 50_000, 50_000]
    );

    // Recovery resets the counter and monitors the node.
    h.transport.fail_all_connects(false);
    h.registry.reconcile_once().await;
    assert_eq!(session.state().await, SessionState::Connected);
    assert_eq!(session.unsuccessful_connects().await, 0);
    assert_eq!(
        node_state(&h.registry, EP_A, "ns=1;i=5").await,
        Some(MonitorState::Monitored)
    );
}

#[tokio::test]
async fn keep_alive_threshold_disconnects_and_recovers() {
    let h = harness(&[entry(EP_A, &[("ns=1;i=5", None, None)])]);
    h.registry.bootstrap().await.unwrap();
    h.registry.reconcile_once().await;

    let session = h.registry.session(EP_A).await.unwrap();
    assert_eq!(session.state().await, SessionState::Connected);

    // Good keep-alives keep the counter clear.
    h.transport.emit_keep_alives(EP_A, StatusCode::GOOD, 3);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(session.state().await, SessionState::Connected);

    // Five consecutive bad keep-alives cross the default threshold.
    h.transport
        .emit_keep_alives(EP_A, StatusCode::BAD_NO_COMMUNICATION, 5);
    eventually!(session.state().await == SessionState::Disconnected);

    // The next tick reconnects and re-monitors everything.
    h.registry.reconcile_once().await;
    assert_eq!(session.state().await, SessionState::Connected);
    assert_eq!(h.transport.connects.load(Ordering::SeqCst), 2);
    assert_eq!(
        node_state(&h.registry, EP_A, "ns=1;i=5").await,
        Some(MonitorState::Monitored)
    );
}

#[tokio::test]
async fn invalid_node_is_parked_not_retried() {
    let h = harness(&[entry(
        EP_A,
        &[("ns=1;i=5", None, None), ("ns=1;i=404", None, None)],
    )]);
    h.transport
        .fail_item_create("ns=1;i=404", StatusCode::BAD_NODE_ID_UNKNOWN);

    h.registry.bootstrap().await.unwrap();
    h.registry.reconcile_once().await;

    assert_eq!(
        node_state(&h.registry, EP_A, "ns=1;i=5").await,
        Some(MonitorState::Monitored)
    );
    assert_eq!(
        node_state(&h.registry, EP_A, "ns=1;i=404").await,
        Some(MonitorState::PermanentlyFailed)
    );

    // Subsequent passes do not hammer the server with the bad node.
    let creates_after_first = h.transport.item_creates.load(Ordering::SeqCst);
    h.registry.reconcile_once().await;
    h.registry.reconcile_once().await;
    assert_eq!(
        h.transport.item_creates.load(Ordering::SeqCst),
        creates_after_first
    );

    // Remove and re-add clears the parked state.
    h.transport.clear_item_faults();
    h.registry
        .remove_node(Some(EP_A), &identity("ns=1;i=404"))
        .await
        .unwrap();
    h.registry.reconcile_once().await;
    h.registry
        .add_node(EP_A, identity("ns=1;i=404"), None, None)
        .await
        .unwrap();
    h.registry.reconcile_once().await;
    assert_eq!(
        node_state(&h.registry, EP_A, "ns=1;i=404").await,
        Some(MonitorState::Monitored)
    );
}

#[tokio::test]
async fn server_side_session_death_aborts_the_pass() {
    let h = harness(&[entry(EP_A, &[("ns=1;i=5", None, None)])]);
    h.registry.bootstrap().await.unwrap();
    h.registry.reconcile_once().await;

    let session = h.registry.session(EP_A).await.unwrap();
    assert_eq!(session.state().await, SessionState::Connected);

    // The server forgets the session; the next item create answers
    // BadSessionIdInvalid.
    h.registry
        .add_node(EP_A, identity("ns=1;i=9"), None, None)
        .await
        .unwrap();
    h.transport.poison_session(EP_A);
    h.registry.reconcile_once().await;

    // Poisoned service calls killed the pass; reconnect happens on a
    // LATER tick (the connect phase already ran this pass).
    assert_eq!(session.state().await, SessionState::Disconnected);

    h.registry.reconcile_once().await;
    assert_eq!(session.state().await, SessionState::Connected);
    assert_eq!(
        node_state(&h.registry, EP_A, "ns=1;i=9").await,
        Some(MonitorState::Monitored)
    );
}

// =============================================================================
// Garbage collection
// =============================================================================

#[tokio::test]
async fn empty_subscriptions_and_sessions_are_collected() {
    let h = harness(&[entry(EP_A, &[("ns=1;i=5", None, None)])]);
    h.registry.bootstrap().await.unwrap();
    h.registry.reconcile_once().await;
    assert_eq!(h.registry.session_count().await, 1);

    h.registry
        .remove_node(Some(EP_A), &identity("ns=1;i=5"))
        .await
        .unwrap();
    h.registry.reconcile_once().await;

    // Item, subscription, and session are all gone; the mock saw the
    // session close.
    assert_eq!(h.registry.session_count().await, 0);
    assert_eq!(h.transport.live_session_count(), 0);
    assert!(!h.transport.deleted_subscriptions.lock().unwrap().is_empty());
}

// =============================================================================
// Notification envelopes
// =============================================================================

#[tokio::test]
async fn envelope_carries_epoch_server_timestamp() {
    let mut h = harness(&[entry(EP_A, &[("ns=1;i=5", None, None)])]);
    h.registry.bootstrap().await.unwrap();
    h.registry.reconcile_once().await;

    let sent = h.transport.emit_data_change(
        EP_A,
        "ns=1;i=5",
        DataValue::new(UaValue::Double(23.5)),
    );
    assert!(sent);

    let payload = tokio::time::timeout(Duration::from_secs(2), h.egress.recv())
        .await
        .expect("notification not forwarded")
        .unwrap();

    assert!(payload.starts_with("{\"ApplicationUri\":\"urn:mock:server\""));
    assert!(payload.contains("\"NodeId\":\"ns=1;i=5\""));
    assert!(payload.contains("\"Value\":{\"Value\":23.5"));
    assert!(payload.contains("\"ServerTimestamp\":\"1970-01-01T00:00:00"));
}

#[tokio::test]
async fn envelope_application_uri_carries_shopfloor_domain() {
    let mut settings = PublisherSettings::default();
    settings.session.shopfloor_domain = Some("hall7".to_string());

    let mut h = build_harness(&[entry(EP_A, &[("ns=1;i=5", None, None)])], settings);
    h.registry.bootstrap().await.unwrap();
    h.registry.reconcile_once().await;

    h.transport
        .emit_data_change(EP_A, "ns=1;i=5", DataValue::new(UaValue::Int32(1)));

    let payload = tokio::time::timeout(Duration::from_secs(2), h.egress.recv())
        .await
        .expect("notification not forwarded")
        .unwrap();
    assert!(payload.starts_with("{\"ApplicationUri\":\"urn:mock:server:hall7\""));
}

// =============================================================================
// Persistence
// =============================================================================

#[tokio::test]
async fn config_round_trip_preserves_tuples_and_forms() {
    let h = harness(&[
        entry(EP_A, &[("ns=1;i=5", Some(500), None)]),
        entry(EP_A, &[("nsu=urn:mock:ns2;i=7", None, Some(2000))]),
    ]);
    h.registry.bootstrap().await.unwrap();
    h.registry.reconcile_once().await;

    let entries = h.registry.snapshot_entries(false).await;
    assert_eq!(entries.len(), 1);

    let mut tuples: Vec<(String, u64, u64)> = entries[0].nodes();
    tuples.sort();
    assert_eq!(
        tuples,
        vec![
            ("ns=1;i=5".to_string(), 500, 1000),
            ("nsu=urn:mock:ns2;i=7".to_string(), 1000, 2000),
        ]
    );

    // Forcing the concrete form resolves the portable identity through
    // the session's namespace table.
    let forced = h.registry.snapshot_entries(true).await;
    let mut forced_nodes: Vec<String> =
        forced[0].nodes().into_iter().map(|(n, _, _)| n).collect();
    forced_nodes.sort();
    assert_eq!(forced_nodes, vec!["ns=1;i=5", "ns=2;i=7"]);
}

#[tokio::test]
async fn runtime_add_survives_restart() {
    let h = harness(&[entry(EP_A, &[("ns=1;i=5", None, None)])]);
    h.registry.bootstrap().await.unwrap();
    h.registry.reconcile_once().await;

    // Runtime add; the dirty pass rewrites the file.
    h.registry
        .add_node(EP_A, identity("ns=1;i=9"), Some(2000), Some(250))
        .await
        .unwrap();
    h.registry.reconcile_once().await;

    // "Restart": a fresh registry + transport against the same file.
    let restarted = {
        let transport = Arc::new(MockTransport::new());
        let (queue, _egress) = MemoryQueue::new();
        SessionRegistry::new(
            Arc::clone(&transport),
            queue,
            PublisherSettings::default(),
            ConfigFile::new(&h.config_path),
            ShutdownToken::new(),
        )
    };
    restarted.bootstrap().await.unwrap();
    restarted.reconcile_once().await;

    // The runtime-added node (upgraded to its portable form before
    // persisting) is monitored again after the restart.
    let session = restarted.session(EP_A).await.unwrap();
    let states = session.item_states().await;
    assert_eq!(states.len(), 2);
    assert!(states.iter().all(|(_, s)| *s == MonitorState::Monitored));
    assert!(
        restarted
            .is_node_published(EP_A, &identity("ns=1;i=9"))
            .await
    );
    assert_eq!(session.subscription_count().await, 2);
}

#[tokio::test]
async fn bootstrap_rejects_malformed_node() {
    let h = harness(&[entry(EP_A, &[("ns=zzz;i=5", None, None)])]);
    assert!(h.registry.bootstrap().await.is_err());
}
