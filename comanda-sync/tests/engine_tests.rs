use comanda_store::SyncStore;
use comanda_sync::bridge::MemoryBridge;
use comanda_sync::discovery::StaticDiscovery;
use comanda_sync::protocol::payload_checksum;
use comanda_sync::transport::mock::{MockChannel, MockTransport};
use comanda_sync::{
    EngineState, MessageKind, PeerDevice, RetryPolicy, SyncConfig, SyncEngine, SyncError,
    SyncMessage,
};
use comanda_types::{ChangePayload, DeviceId, LocalStamp, MessageId};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn test_config() -> SyncConfig {
    SyncConfig {
        device_name: "test-device".to_string(),
        // Long heartbeat/liveness so tests control all traffic.
        heartbeat_interval: Duration::from_secs(30),
        liveness_timeout: Duration::from_secs(120),
        connect_timeout: Duration::from_millis(500),
        send_timeout: Duration::from_secs(1),
        drain_timeout: Duration::from_secs(1),
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(400),
            factor: 2.0,
            jitter: 0.0,
        },
        priorities: Default::default(),
    }
}

struct Harness {
    engine: SyncEngine,
    store: Arc<SyncStore>,
    bridge: Arc<MemoryBridge>,
    discovery: Arc<StaticDiscovery>,
    transport: Arc<MockTransport>,
    local: DeviceId,
}

async fn harness_with_store(store: Arc<SyncStore>) -> Harness {
    let local = DeviceId::new();
    let bridge = Arc::new(MemoryBridge::new());
    let discovery = Arc::new(StaticDiscovery::new(local, vec![]));
    let transport = Arc::new(MockTransport::new(local));
    let engine = SyncEngine::new(
        test_config(),
        Arc::clone(&store),
        bridge.clone(),
        discovery.clone(),
        transport.clone(),
    );
    engine.initialize().await.unwrap();
    engine.start_sync().await.unwrap();
    Harness {
        engine,
        store,
        bridge,
        discovery,
        transport,
        local,
    }
}

async fn harness() -> Harness {
    harness_with_store(Arc::new(SyncStore::open_in_memory().unwrap())).await
}

impl Harness {
    /// Wires a reachable remote peer and returns the harness-side end of
    /// its channel.
    async fn attach_peer(&self, remote: DeviceId) -> MockChannel {
        let (engine_end, harness_end) = MockChannel::pair(self.local, remote);
        self.transport.stage(remote, engine_end).await;
        self.discovery.inject(PeerDevice::new(remote, "remote")).await;
        harness_end
    }

    async fn wait_connected(&self, n: usize) {
        eventually(|| async { self.engine.status().await.connected_peers == n }).await;
    }
}

async fn eventually<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..300 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 3s");
}

/// Pulls the next non-heartbeat message, bounded.
async fn pull_message(channel: &mut MockChannel, wait: Duration) -> Option<SyncMessage> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return None;
        }
        match channel.pull_timeout(remaining).await {
            Some(msg) if msg.kind == MessageKind::Heartbeat => continue,
            other => return other,
        }
    }
}

fn remote_change(
    sender: DeviceId,
    kind: MessageKind,
    record: &str,
    data: serde_json::Value,
    version: u64,
    counter: u64,
    priority: i64,
) -> SyncMessage {
    SyncMessage::change(
        sender,
        kind,
        &ChangePayload::new(record, data),
        version,
        LocalStamp {
            wall_ms: 1_700_000_000_000,
            counter,
        },
        priority,
    )
}

// ── Lifecycle ────────────────────────────────────────────────────

#[tokio::test]
async fn lifecycle_calls_are_idempotent() {
    let local = DeviceId::new();
    let engine = SyncEngine::new(
        test_config(),
        Arc::new(SyncStore::open_in_memory().unwrap()),
        Arc::new(MemoryBridge::new()),
        Arc::new(StaticDiscovery::new(local, vec![])),
        Arc::new(MockTransport::new(local)),
    );

    assert_eq!(engine.state().await, EngineState::Idle);

    // Starting without initializing is an invalid transition.
    assert!(matches!(
        engine.start_sync().await,
        Err(SyncError::InvalidState { .. })
    ));

    engine.initialize().await.unwrap();
    engine.initialize().await.unwrap();
    assert_eq!(engine.state().await, EngineState::Initializing);

    engine.start_sync().await.unwrap();
    engine.start_sync().await.unwrap();
    assert_eq!(engine.state().await, EngineState::Active);
    assert!(engine.state().await.is_active());

    engine.stop_sync().await.unwrap();
    engine.stop_sync().await.unwrap();
    assert_eq!(engine.state().await, EngineState::Idle);

    // Restartable after a stop.
    engine.initialize().await.unwrap();
    engine.start_sync().await.unwrap();
    engine.stop_sync().await.unwrap();

    engine.cleanup().await.unwrap();
    engine.cleanup().await.unwrap();
    assert_eq!(engine.state().await, EngineState::Idle);
}

#[tokio::test]
async fn discovered_peer_gets_a_loop_and_a_heartbeat() {
    let h = harness().await;
    let remote = DeviceId::new();
    let mut channel = h.attach_peer(remote).await;

    h.wait_connected(1).await;

    // The first thing on a fresh channel is a greeting heartbeat.
    let first = channel.pull_timeout(Duration::from_secs(1)).await.unwrap();
    assert_eq!(first.kind, MessageKind::Heartbeat);
    assert_eq!(first.sender, h.local);
}

// ── Outbound path ────────────────────────────────────────────────

#[tokio::test]
async fn publish_reaches_the_peer_and_ack_clears_the_outbox() {
    let h = harness().await;
    let remote = DeviceId::new();
    let mut channel = h.attach_peer(remote).await;
    h.wait_connected(1).await;

    let id = h
        .engine
        .publish_local_change(
            MessageKind::TableStatusUpdate,
            "T-02",
            json!({"status": "OCCUPIED"}),
        )
        .await
        .unwrap();

    let msg = pull_message(&mut channel, Duration::from_secs(1))
        .await
        .expect("change should arrive");
    assert_eq!(msg.id, id);
    assert_eq!(msg.kind, MessageKind::TableStatusUpdate);
    assert_eq!(msg.version, 1);
    assert!(msg.verify_checksum().is_ok());
    assert_eq!(h.engine.status().await.pending_outbox, 1);

    channel
        .push(SyncMessage::ack(remote, id, 1_000))
        .await
        .unwrap();

    eventually(|| async { h.engine.status().await.pending_outbox == 0 }).await;
    assert!(h.engine.status().await.last_sync_ms.is_some());
}

#[tokio::test]
async fn versions_increase_per_record() {
    let h = harness().await;
    let remote = DeviceId::new();
    let mut channel = h.attach_peer(remote).await;
    h.wait_connected(1).await;

    h.engine
        .publish_local_change(MessageKind::TableStatusUpdate, "T-01", json!({"s": 1}))
        .await
        .unwrap();
    h.engine
        .publish_local_change(MessageKind::TableStatusUpdate, "T-01", json!({"s": 2}))
        .await
        .unwrap();
    // Different record starts over.
    h.engine
        .publish_local_change(MessageKind::TableStatusUpdate, "T-09", json!({"s": 3}))
        .await
        .unwrap();

    // Collect until all three distinct changes arrived, acking each so
    // retransmissions never interleave with the assertion.
    let mut seen: Vec<SyncMessage> = Vec::new();
    while seen.len() < 3 {
        let msg = pull_message(&mut channel, Duration::from_secs(2))
            .await
            .expect("change should arrive");
        if seen.iter().all(|m| m.id != msg.id) {
            channel
                .push(SyncMessage::ack(remote, msg.id, 1_000))
                .await
                .unwrap();
            seen.push(msg);
        }
    }

    let t01: Vec<u64> = seen
        .iter()
        .filter(|m| m.payload.contains("\"record\":\"T-01\""))
        .map(|m| m.version)
        .collect();
    let t09: Vec<u64> = seen
        .iter()
        .filter(|m| m.payload.contains("\"record\":\"T-09\""))
        .map(|m| m.version)
        .collect();
    assert_eq!(t01, vec![1, 2]);
    assert_eq!(t09, vec![1]);
}

#[tokio::test]
async fn unacked_sends_back_off_then_presume_unreachable() {
    let h = harness().await;
    let remote = DeviceId::new();
    let mut channel = h.attach_peer(remote).await;
    h.wait_connected(1).await;

    let id = h
        .engine
        .publish_local_change(MessageKind::OrderUpdate, "o-1", json!({"total": 10}))
        .await
        .unwrap();

    // max_attempts = 3: the same message arrives exactly three times.
    for attempt in 0..3 {
        let msg = pull_message(&mut channel, Duration::from_secs(2))
            .await
            .unwrap_or_else(|| panic!("attempt {attempt} should arrive"));
        assert_eq!(msg.id, id);
    }

    // Budget exhausted: loop ends, peer marked disconnected, entry kept.
    eventually(|| async { h.engine.status().await.connected_peers == 0 }).await;
    assert_eq!(h.engine.status().await.pending_outbox, 1);
    assert_eq!(h.store.pending_count_for_peer(&remote).unwrap(), 1);
}

// ── Inbound path ─────────────────────────────────────────────────

#[tokio::test]
async fn incoming_change_is_applied_recorded_and_acked() {
    let h = harness().await;
    let remote = DeviceId::new();
    let mut channel = h.attach_peer(remote).await;
    h.wait_connected(1).await;

    let msg = remote_change(
        remote,
        MessageKind::TableStatusUpdate,
        "T-02",
        json!({"status": "DIRTY"}),
        1,
        10,
        0,
    );
    channel.push(msg.clone()).await.unwrap();

    let ack = pull_message(&mut channel, Duration::from_secs(1))
        .await
        .expect("ack should arrive");
    assert_eq!(ack.kind, MessageKind::Ack);
    assert_eq!(ack.acked_id().unwrap(), msg.id);

    assert_eq!(h.bridge.apply_count(), 1);
    assert!(h.bridge.record("T-02").unwrap().contains("DIRTY"));
    assert!(h.store.is_processed(&msg.id).unwrap());
}

#[tokio::test]
async fn duplicate_change_is_acked_without_reapplying() {
    let h = harness().await;
    let remote = DeviceId::new();
    let mut channel = h.attach_peer(remote).await;
    h.wait_connected(1).await;

    let msg = remote_change(
        remote,
        MessageKind::OrderCreate,
        "o-7",
        json!({"items": []}),
        1,
        5,
        0,
    );

    channel.push(msg.clone()).await.unwrap();
    let first_ack = pull_message(&mut channel, Duration::from_secs(1)).await.unwrap();
    assert_eq!(first_ack.acked_id().unwrap(), msg.id);

    // Replay: acknowledged again, entity state untouched.
    channel.push(msg.clone()).await.unwrap();
    let second_ack = pull_message(&mut channel, Duration::from_secs(1)).await.unwrap();
    assert_eq!(second_ack.acked_id().unwrap(), msg.id);

    assert_eq!(h.bridge.apply_count(), 1);
}

#[tokio::test]
async fn checksum_mismatch_is_dropped_without_ack() {
    let h = harness().await;
    let remote = DeviceId::new();
    let mut channel = h.attach_peer(remote).await;
    h.wait_connected(1).await;

    let mut msg = remote_change(
        remote,
        MessageKind::TableStatusUpdate,
        "T-02",
        json!({"status": "DIRTY"}),
        1,
        10,
        0,
    );
    msg.payload = msg.payload.replace("DIRTY", "FREE"); // corrupt in flight
    channel.push(msg.clone()).await.unwrap();

    assert!(pull_message(&mut channel, Duration::from_millis(300))
        .await
        .is_none());
    assert_eq!(h.bridge.apply_count(), 0);
    assert!(!h.store.is_processed(&msg.id).unwrap());
    assert!(h.engine.status().await.sync_errors >= 1);
}

#[tokio::test]
async fn malformed_payload_is_dropped_without_ack() {
    let h = harness().await;
    let remote = DeviceId::new();
    let mut channel = h.attach_peer(remote).await;
    h.wait_connected(1).await;

    // Valid checksum over a payload the sync layer cannot read.
    let payload = "{broken".to_string();
    let msg = SyncMessage {
        id: MessageId::new(),
        sender: remote,
        kind: MessageKind::TableStatusUpdate,
        checksum: Some(payload_checksum(&payload)),
        payload,
        timestamp: 1_000,
        version: 1,
        counter: 1,
        priority: 0,
    };
    channel.push(msg.clone()).await.unwrap();

    assert!(pull_message(&mut channel, Duration::from_millis(300))
        .await
        .is_none());
    assert_eq!(h.bridge.apply_count(), 0);
    assert!(!h.store.is_processed(&msg.id).unwrap());
}

#[tokio::test]
async fn apply_failure_is_not_acked_and_succeeds_on_retry() {
    let h = harness().await;
    let remote = DeviceId::new();
    let mut channel = h.attach_peer(remote).await;
    h.wait_connected(1).await;

    h.bridge.fail_next(1);
    let msg = remote_change(
        remote,
        MessageKind::MenuUpdate,
        "espresso",
        json!({"price_cents": 300}),
        1,
        4,
        0,
    );

    channel.push(msg.clone()).await.unwrap();
    assert!(pull_message(&mut channel, Duration::from_millis(300))
        .await
        .is_none());
    assert!(!h.store.is_processed(&msg.id).unwrap());

    // The sender retries the unacknowledged message.
    channel.push(msg.clone()).await.unwrap();
    let ack = pull_message(&mut channel, Duration::from_secs(1)).await.unwrap();
    assert_eq!(ack.acked_id().unwrap(), msg.id);
    assert_eq!(h.bridge.apply_count(), 1);
    assert!(h.store.is_processed(&msg.id).unwrap());
}

// ── Conflict resolution through the engine ───────────────────────

#[tokio::test]
async fn counter_tiebreak_converges_regardless_of_arrival_order() {
    for reversed in [false, true] {
        let h = harness().await;
        let remote = DeviceId::new();
        let mut channel = h.attach_peer(remote).await;
        h.wait_connected(1).await;

        let occupied = remote_change(
            remote,
            MessageKind::TableStatusUpdate,
            "T-02",
            json!({"status": "OCCUPIED"}),
            5,
            100,
            0,
        );
        let dirty = remote_change(
            remote,
            MessageKind::TableStatusUpdate,
            "T-02",
            json!({"status": "DIRTY"}),
            5,
            150,
            0,
        );

        let (first, second) = if reversed {
            (dirty.clone(), occupied.clone())
        } else {
            (occupied.clone(), dirty.clone())
        };

        channel.push(first.clone()).await.unwrap();
        pull_message(&mut channel, Duration::from_secs(1)).await.unwrap();
        channel.push(second.clone()).await.unwrap();
        pull_message(&mut channel, Duration::from_secs(1)).await.unwrap();

        // Both orders land on DIRTY (the larger counter).
        assert!(
            h.bridge.record("T-02").unwrap().contains("DIRTY"),
            "reversed={reversed}"
        );
        // Both messages are in the ledger either way.
        assert!(h.store.is_processed(&occupied.id).unwrap());
        assert!(h.store.is_processed(&dirty.id).unwrap());
    }
}

#[tokio::test]
async fn kitchen_claim_survives_a_higher_versioned_edit() {
    let h = harness().await;
    let remote = DeviceId::new();
    let mut channel = h.attach_peer(remote).await;
    h.wait_connected(1).await;

    let claim = remote_change(
        remote,
        MessageKind::ChiefClaim,
        "42",
        json!({"claimed_by": "grill"}),
        3,
        1,
        10,
    );
    let edit = remote_change(
        remote,
        MessageKind::OrderDetailUpdate,
        "42",
        json!({"note": "extra cheese"}),
        9,
        999,
        0,
    );

    channel.push(claim.clone()).await.unwrap();
    pull_message(&mut channel, Duration::from_secs(1)).await.unwrap();
    channel.push(edit.clone()).await.unwrap();
    let edit_ack = pull_message(&mut channel, Duration::from_secs(1)).await.unwrap();

    // The losing edit is still acknowledged (it is processed, not lost),
    // but the claim's content survives.
    assert_eq!(edit_ack.acked_id().unwrap(), edit.id);
    assert!(h.bridge.record("42").unwrap().contains("claimed_by"));
    assert_eq!(h.bridge.apply_count(), 1);
}

// ── Relay ────────────────────────────────────────────────────────

#[tokio::test]
async fn applied_changes_are_relayed_to_other_peers() {
    let h = harness().await;
    let origin = DeviceId::new();
    let bystander = DeviceId::new();
    let mut origin_channel = h.attach_peer(origin).await;
    let mut bystander_channel = h.attach_peer(bystander).await;
    h.wait_connected(2).await;

    let msg = remote_change(
        origin,
        MessageKind::OrderUpdate,
        "o-3",
        json!({"total": 42}),
        1,
        8,
        0,
    );
    origin_channel.push(msg.clone()).await.unwrap();

    // Origin gets an ack; the bystander gets the relayed change.
    let ack = pull_message(&mut origin_channel, Duration::from_secs(1)).await.unwrap();
    assert_eq!(ack.kind, MessageKind::Ack);

    let relayed = pull_message(&mut bystander_channel, Duration::from_secs(2))
        .await
        .expect("relay should arrive");
    assert_eq!(relayed.id, msg.id);
    assert_eq!(relayed.sender, origin);
}

// ── Stop ─────────────────────────────────────────────────────────

#[tokio::test]
async fn stop_sync_drains_loops_and_disconnects_peers() {
    let h = harness().await;
    let remote = DeviceId::new();
    let _channel = h.attach_peer(remote).await;
    h.wait_connected(1).await;

    h.engine.stop_sync().await.unwrap();
    assert_eq!(h.engine.state().await, EngineState::Idle);
    assert_eq!(h.engine.status().await.connected_peers, 0);
}

#[tokio::test]
async fn removing_a_peer_discards_its_outbox() {
    let h = harness().await;
    let remote = DeviceId::new();

    // Known but unreachable: entries park in the outbox.
    h.discovery.inject(PeerDevice::new(remote, "till")).await;
    eventually(|| async { !h.engine.peers().await.is_empty() }).await;
    h.engine
        .publish_local_change(MessageKind::OrderUpdate, "o-9", json!({"total": 7}))
        .await
        .unwrap();
    assert_eq!(h.engine.status().await.pending_outbox, 1);

    h.engine.remove_peer(remote).await.unwrap();
    assert_eq!(h.engine.status().await.pending_outbox, 0);
    assert!(h.engine.peers().await.is_empty());
}

#[tokio::test]
async fn publish_without_peers_parks_nothing() {
    let h = harness().await;
    // No peers known: the change only touches local state.
    h.engine
        .publish_local_change(MessageKind::MenuUpdate, "latte", json!({"price_cents": 400}))
        .await
        .unwrap();
    assert_eq!(h.engine.status().await.pending_outbox, 0);
}

#[tokio::test]
async fn heartbeat_kinds_cannot_be_published() {
    let h = harness().await;
    let err = h
        .engine
        .publish_local_change(MessageKind::Heartbeat, "x", json!({}))
        .await;
    assert!(matches!(err, Err(SyncError::Protocol(_))));
}
