use comanda_sync::discovery::{elect_owner, Discovery, DiscoveryEvent, StaticDiscovery};
use comanda_sync::PeerDevice;
use comanda_types::DeviceId;
use uuid::Uuid;

fn device(n: u8) -> DeviceId {
    let mut bytes = [0u8; 16];
    bytes[15] = n;
    DeviceId::from_uuid(Uuid::from_bytes(bytes))
}

#[tokio::test]
async fn start_announces_the_initial_peer_set() {
    let local = device(1);
    let discovery = StaticDiscovery::new(
        local,
        vec![
            PeerDevice::new(device(2), "till"),
            PeerDevice::new(device(3), "bar"),
        ],
    );
    discovery.start().await.unwrap();

    let mut found = Vec::new();
    for _ in 0..2 {
        match discovery.next_event().await.unwrap() {
            DiscoveryEvent::Found(peer) => found.push(peer.device_id),
            other => panic!("unexpected event {other:?}"),
        }
    }
    found.sort();
    assert_eq!(found, vec![device(2), device(3)]);
}

#[tokio::test]
async fn inject_and_drop_emit_events() {
    let discovery = StaticDiscovery::new(device(1), vec![]);
    discovery.start().await.unwrap();

    discovery.inject(PeerDevice::new(device(9), "floor")).await;
    match discovery.next_event().await.unwrap() {
        DiscoveryEvent::Found(peer) => assert_eq!(peer.device_id, device(9)),
        other => panic!("unexpected event {other:?}"),
    }

    discovery.drop_peer(device(9)).await;
    match discovery.next_event().await.unwrap() {
        DiscoveryEvent::Lost(id) => assert_eq!(id, device(9)),
        other => panic!("unexpected event {other:?}"),
    }
    assert!(discovery.peers().is_empty());
}

#[tokio::test]
async fn peer_snapshot_flags_the_elected_owner() {
    let local = device(5);
    let discovery = StaticDiscovery::new(
        local,
        vec![
            PeerDevice::new(device(2), "till"),
            PeerDevice::new(device(8), "bar"),
        ],
    );

    let peers = discovery.peers();
    let owners: Vec<DeviceId> = peers
        .iter()
        .filter(|p| p.group_owner)
        .map(|p| p.device_id)
        .collect();
    assert_eq!(owners, vec![device(2)]);
}

#[test]
fn owner_election_is_deterministic_for_every_member() {
    // Each device computes the election locally over the same visible
    // set and must agree.
    let all: Vec<DeviceId> = (1..=4).map(device).collect();
    for me in &all {
        let others: Vec<PeerDevice> = all
            .iter()
            .filter(|d| *d != me)
            .map(|d| PeerDevice::new(*d, "x"))
            .collect();
        assert_eq!(elect_owner(*me, &others), device(1));
    }
}
