//! Peer model.

use comanda_types::DeviceId;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// How a peer is currently reachable.
///
/// Exactly one variant is active per peer at a time; the fallback is only
/// attempted after the direct mechanism fails to establish a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionType {
    /// Primary direct peer-to-peer link.
    Direct,
    /// Local-network service-discovery fallback.
    ServiceDiscovery,
    /// No link established.
    Disconnected,
}

impl ConnectionType {
    /// Whether a link is up.
    pub fn is_connected(&self) -> bool {
        !matches!(self, ConnectionType::Disconnected)
    }
}

/// A remote device visible on the venue network.
///
/// Created on discovery, mutated on heartbeat/connect/disconnect events,
/// discarded once no longer discoverable and disconnected. The
/// `group_owner` flag is a transport bootstrap detail and never grants
/// any authority over conflict resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerDevice {
    /// Stable device identifier.
    pub device_id: DeviceId,
    /// Display name.
    pub name: String,
    /// Endpoint the device advertises as its stable direct address.
    pub direct_addr: Option<SocketAddr>,
    /// Endpoint resolved via local-network service discovery.
    pub service_addr: Option<SocketAddr>,
    /// Active connection mechanism.
    pub connection: ConnectionType,
    /// Whether this device is the elected transport-level group owner.
    pub group_owner: bool,
    /// Last time we saw any traffic or advertisement, epoch milliseconds.
    pub last_seen_ms: u64,
    /// Whether a sync loop currently holds a live channel to this peer.
    pub connected: bool,
}

impl PeerDevice {
    /// Creates a freshly discovered, not-yet-connected peer.
    pub fn new(device_id: DeviceId, name: impl Into<String>) -> Self {
        Self {
            device_id,
            name: name.into(),
            direct_addr: None,
            service_addr: None,
            connection: ConnectionType::Disconnected,
            group_owner: false,
            last_seen_ms: 0,
            connected: false,
        }
    }

    /// Marks the peer seen now.
    pub fn touch(&mut self, now_ms: u64) {
        self.last_seen_ms = now_ms;
    }

    /// Marks the peer disconnected, keeping its discovery addresses.
    pub fn mark_disconnected(&mut self) {
        self.connection = ConnectionType::Disconnected;
        self.connected = false;
    }
}
