//! End-to-end service scenarios: crash recovery and cross-device
//! convergence.

use comanda_store::SyncStore;
use comanda_sync::bridge::MemoryBridge;
use comanda_sync::discovery::StaticDiscovery;
use comanda_sync::transport::mock::{MockChannel, MockTransport};
use comanda_sync::{
    MessageKind, PeerDevice, RetryPolicy, SyncConfig, SyncEngine, SyncMessage,
};
use comanda_types::{DeviceId, MessageId};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn test_config() -> SyncConfig {
    SyncConfig {
        device_name: "scenario-device".to_string(),
        heartbeat_interval: Duration::from_secs(30),
        liveness_timeout: Duration::from_secs(120),
        connect_timeout: Duration::from_millis(500),
        send_timeout: Duration::from_secs(1),
        drain_timeout: Duration::from_secs(1),
        retry: RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(400),
            factor: 2.0,
            jitter: 0.0,
        },
        priorities: Default::default(),
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .try_init();
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

/// Peer P disconnects with unacknowledged outbox entries; the process
/// dies; on restart and reconnect all of them are delivered exactly once.
#[tokio::test(flavor = "multi_thread")]
async fn outbox_survives_crash_and_delivers_on_reconnect() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sync.db");
    let remote = DeviceId::new();

    let published: Vec<MessageId>;
    {
        // First life: the peer is known but unreachable.
        let local = DeviceId::new();
        let store = Arc::new(SyncStore::open(&path).unwrap());
        let discovery = Arc::new(StaticDiscovery::new(local, vec![]));
        let transport = Arc::new(MockTransport::new(local));
        let engine = SyncEngine::new(
            test_config(),
            Arc::clone(&store),
            Arc::new(MemoryBridge::new()),
            discovery.clone(),
            transport,
        );
        engine.initialize().await.unwrap();
        engine.start_sync().await.unwrap();

        // No staged channel: connect fails, the peer stays in the roster.
        discovery.inject(PeerDevice::new(remote, "till")).await;
        eventually(|| async { !engine.peers().await.is_empty() }).await;

        let mut ids = Vec::new();
        for n in 0..3 {
            let id = engine
                .publish_local_change(
                    MessageKind::OrderUpdate,
                    format!("o-{n}"),
                    json!({"total": n}),
                )
                .await
                .unwrap();
            ids.push(id);
        }
        published = ids;

        assert_eq!(engine.status().await.pending_outbox, 3);
        engine.stop_sync().await.unwrap();
        // Process "crashes" here: nothing else is flushed or torn down.
    }

    // Second life: same database, fresh engine, peer now reachable.
    let local = DeviceId::new();
    let store = Arc::new(SyncStore::open(&path).unwrap());
    assert_eq!(store.pending_count().unwrap(), 3);

    let discovery = Arc::new(StaticDiscovery::new(local, vec![]));
    let transport = Arc::new(MockTransport::new(local));
    let engine = SyncEngine::new(
        test_config(),
        Arc::clone(&store),
        Arc::new(MemoryBridge::new()),
        discovery.clone(),
        transport.clone(),
    );
    engine.initialize().await.unwrap();
    engine.start_sync().await.unwrap();

    let (engine_end, mut channel) = MockChannel::pair(local, remote);
    transport.stage(remote, engine_end).await;
    discovery.inject(PeerDevice::new(remote, "till")).await;

    // All three arrive, in enqueue order, none duplicated.
    let mut received = Vec::new();
    while received.len() < 3 {
        let msg = pull_message(&mut channel, Duration::from_secs(2))
            .await
            .expect("queued change should arrive");
        if received.iter().all(|m: &SyncMessage| m.id != msg.id) {
            channel
                .push(SyncMessage::ack(remote, msg.id, 1_000))
                .await
                .unwrap();
            received.push(msg);
        }
    }
    let received_ids: Vec<MessageId> = received.iter().map(|m| m.id).collect();
    assert_eq!(received_ids, published);

    eventually(|| async { engine.status().await.pending_outbox == 0 }).await;
}

struct Device {
    engine: SyncEngine,
    bridge: Arc<MemoryBridge>,
    discovery: Arc<StaticDiscovery>,
    transport: Arc<MockTransport>,
    id: DeviceId,
}

async fn device() -> Device {
    let id = DeviceId::new();
    let bridge = Arc::new(MemoryBridge::new());
    let discovery = Arc::new(StaticDiscovery::new(id, vec![]));
    let transport = Arc::new(MockTransport::new(id));
    let engine = SyncEngine::new(
        test_config(),
        Arc::new(SyncStore::open_in_memory().unwrap()),
        bridge.clone(),
        discovery.clone(),
        transport.clone(),
    );
    engine.initialize().await.unwrap();
    engine.start_sync().await.unwrap();
    Device {
        engine,
        bridge,
        discovery,
        transport,
        id,
    }
}

/// Two live engines: changes made while the devices were disconnected
/// converge once they meet, and live traffic flows in both directions.
#[tokio::test(flavor = "multi_thread")]
async fn two_engines_converge() {
    init_tracing();
    let a = device().await;
    let b = device().await;

    // Both devices know of each other but no link exists yet.
    a.discovery.inject(PeerDevice::new(b.id, "bar")).await;
    b.discovery.inject(PeerDevice::new(a.id, "floor")).await;
    eventually(|| async { !a.engine.peers().await.is_empty() }).await;
    eventually(|| async { !b.engine.peers().await.is_empty() }).await;

    // Concurrent write to the same record while disconnected: both sides
    // publish version 1 for T-3; B's later local counter must win
    // everywhere once the devices meet.
    a.engine
        .publish_local_change(MessageKind::TableStatusUpdate, "T-3", json!({"status": "OCCUPIED"}))
        .await
        .unwrap();
    // Make the local counters unambiguous across the two devices.
    tokio::time::sleep(Duration::from_millis(2)).await;
    b.engine
        .publish_local_change(MessageKind::TableStatusUpdate, "T-3", json!({"status": "DIRTY"}))
        .await
        .unwrap();
    assert_eq!(a.engine.status().await.pending_outbox, 1);
    assert_eq!(b.engine.status().await.pending_outbox, 1);

    // The devices meet: A dials B, B adopts the inbound end.
    let (a_end, b_end) = MockChannel::pair(a.id, b.id);
    a.transport.stage(b.id, a_end).await;
    b.transport.push_incoming(b_end).await;
    a.discovery.inject(PeerDevice::new(b.id, "bar")).await;

    eventually(|| async { a.engine.status().await.connected_peers == 1 }).await;
    eventually(|| async { b.engine.status().await.connected_peers == 1 }).await;

    // A applies B's winning DIRTY; B discards A's losing OCCUPIED (its
    // own application state already holds DIRTY) yet still acknowledges.
    eventually(|| async {
        a.bridge
            .record("T-3")
            .map(|r| r.contains("DIRTY"))
            .unwrap_or(false)
    })
    .await;
    eventually(|| async { a.engine.status().await.pending_outbox == 0 }).await;
    eventually(|| async { b.engine.status().await.pending_outbox == 0 }).await;
    assert!(b.bridge.record("T-3").is_none());

    // Live traffic now flows in both directions.
    a.engine
        .publish_local_change(MessageKind::TableStatusUpdate, "T-1", json!({"status": "OCCUPIED"}))
        .await
        .unwrap();
    b.engine
        .publish_local_change(MessageKind::TableStatusUpdate, "T-2", json!({"status": "DIRTY"}))
        .await
        .unwrap();

    eventually(|| async { b.bridge.record("T-1").is_some() }).await;
    eventually(|| async { a.bridge.record("T-2").is_some() }).await;
    assert!(b.bridge.record("T-1").unwrap().contains("OCCUPIED"));
    assert!(a.bridge.record("T-2").unwrap().contains("DIRTY"));

    eventually(|| async { a.engine.status().await.pending_outbox == 0 }).await;
    eventually(|| async { b.engine.status().await.pending_outbox == 0 }).await;

    a.engine.stop_sync().await.unwrap();
    b.engine.stop_sync().await.unwrap();
}
