//! Peer discovery on the venue LAN.
//!
//! Devices advertise a `_comanda._udp.local.` service instance named by
//! their device id, carrying the display name and (when known) a stable
//! direct endpoint in TXT properties. Browsing the same service type
//! yields the visible peer set.
//!
//! One device in a visible group is elected transport-level group owner:
//! the local access point for the direct link. The election is pure
//! bookkeeping over device ids. Owners carry zero authority over sync;
//! venue tablets churn, and any coordinator would be a single point of
//! failure.

use crate::error::{SyncError, SyncResult};
use crate::peer::PeerDevice;
use async_trait::async_trait;
use comanda_types::DeviceId;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// The mDNS service type advertised by every Comanda device.
pub const SERVICE_TYPE: &str = "_comanda._udp.local.";

/// Re-advertisement interval, so late joiners always see us.
const READVERTISE_INTERVAL: Duration = Duration::from_secs(60);

/// A change in the visible peer set.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A device became visible.
    Found(PeerDevice),
    /// A visible device re-announced (addresses or name may have changed).
    Updated(PeerDevice),
    /// A device stopped advertising.
    Lost(DeviceId),
}

/// Produces the set of visible peer devices.
///
/// Discovery only observes: it never applies or resolves changes.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Starts advertising and browsing.
    async fn start(&self) -> SyncResult<()>;

    /// Stops advertising and browsing.
    async fn stop(&self);

    /// Our device id.
    fn local_id(&self) -> DeviceId;

    /// Snapshot of the visible peers, with the group-owner flag set on
    /// the elected device.
    fn peers(&self) -> Vec<PeerDevice>;

    /// Next change in the visible peer set. Returns `None` once discovery
    /// has stopped.
    async fn next_event(&self) -> Option<DiscoveryEvent>;
}

/// Elects the transport-level group owner for a visible group.
///
/// Deterministic so every device in the group agrees without talking:
/// the smallest device id (self included) wins.
pub fn elect_owner(local: DeviceId, peers: &[PeerDevice]) -> DeviceId {
    peers
        .iter()
        .map(|p| p.device_id)
        .chain(std::iter::once(local))
        .min()
        .unwrap_or(local)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Applies the owner election to a peer snapshot.
fn flag_owner(local: DeviceId, mut peers: Vec<PeerDevice>) -> Vec<PeerDevice> {
    let owner = elect_owner(local, &peers);
    for peer in &mut peers {
        peer.group_owner = peer.device_id == owner;
    }
    peers
}

// ── mDNS implementation ──────────────────────────────────────────

/// mDNS-based peer discovery.
pub struct MdnsDiscovery {
    device_id: DeviceId,
    device_name: String,
    /// Port our transport listens on, advertised to peers.
    listen_port: u16,
    /// Stable direct endpoint advertised in TXT properties, if known.
    direct_addr: Option<SocketAddr>,
    daemon: ServiceDaemon,
    peers: Arc<RwLock<HashMap<DeviceId, PeerDevice>>>,
    events_tx: mpsc::Sender<DiscoveryEvent>,
    events_rx: Mutex<mpsc::Receiver<DiscoveryEvent>>,
    running: Arc<AtomicBool>,
}

impl MdnsDiscovery {
    /// Creates a new discovery instance. Advertising begins on `start`.
    pub fn new(
        device_id: DeviceId,
        device_name: impl Into<String>,
        listen_port: u16,
        direct_addr: Option<SocketAddr>,
    ) -> SyncResult<Self> {
        let daemon =
            ServiceDaemon::new().map_err(|e| SyncError::Discovery(format!("mdns daemon: {e}")))?;
        let (events_tx, events_rx) = mpsc::channel(64);
        Ok(Self {
            device_id,
            device_name: device_name.into(),
            listen_port,
            direct_addr,
            daemon,
            peers: Arc::new(RwLock::new(HashMap::new())),
            events_tx,
            events_rx: Mutex::new(events_rx),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    fn instance_name(&self) -> String {
        self.device_id.to_string()
    }

    fn full_name(&self) -> String {
        format!("{}.{}", self.instance_name(), SERVICE_TYPE)
    }

    fn build_service_info(&self) -> SyncResult<ServiceInfo> {
        let mut properties = HashMap::new();
        properties.insert("name".to_string(), self.device_name.clone());
        if let Some(direct) = self.direct_addr {
            properties.insert("direct".to_string(), direct.to_string());
        }

        let instance = self.instance_name();
        ServiceInfo::new(
            SERVICE_TYPE,
            &instance,
            &format!("{instance}."),
            IpAddr::V4(local_ipv4()),
            self.listen_port,
            Some(properties),
        )
        .map_err(|e| SyncError::Discovery(format!("service info: {e}")))
    }

    async fn handle_event(
        event: ServiceEvent,
        local_id: DeviceId,
        peers: &RwLock<HashMap<DeviceId, PeerDevice>>,
        events_tx: &mpsc::Sender<DiscoveryEvent>,
    ) {
        match event {
            ServiceEvent::ServiceResolved(info) => {
                let raw_id = info
                    .get_fullname()
                    .replace(&format!(".{SERVICE_TYPE}"), "");
                if raw_id == local_id.to_string() {
                    return;
                }
                let Ok(device_id) = raw_id.parse::<DeviceId>() else {
                    warn!("peer advertising an invalid device id: {raw_id}");
                    return;
                };

                let name = info
                    .get_property_val_str("name")
                    .unwrap_or("Unknown Device")
                    .to_string();
                let direct_addr = info
                    .get_property_val_str("direct")
                    .and_then(|s| s.parse().ok());
                let service_addr = info
                    .get_addresses()
                    .iter()
                    .next()
                    .map(|addr| SocketAddr::new(*addr, info.get_port()));

                let (peer, fresh) = {
                    let mut map = peers.write().unwrap_or_else(|e| e.into_inner());
                    let fresh = !map.contains_key(&device_id);
                    let peer = map
                        .entry(device_id)
                        .or_insert_with(|| PeerDevice::new(device_id, name.clone()));
                    peer.name = name;
                    peer.direct_addr = direct_addr.or(peer.direct_addr);
                    peer.service_addr = service_addr.or(peer.service_addr);
                    peer.touch(now_ms());
                    (peer.clone(), fresh)
                };

                if fresh {
                    info!("discovered peer {} ({})", peer.device_id, peer.name);
                    let _ = events_tx.send(DiscoveryEvent::Found(peer)).await;
                } else {
                    debug!("peer {} re-announced", peer.device_id);
                    let _ = events_tx.send(DiscoveryEvent::Updated(peer)).await;
                }
            }
            ServiceEvent::ServiceRemoved(_, fullname) => {
                let raw_id = fullname.replace(&format!(".{SERVICE_TYPE}"), "");
                if raw_id == local_id.to_string() {
                    return;
                }
                let Ok(device_id) = raw_id.parse::<DeviceId>() else {
                    return;
                };
                let removed = peers
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&device_id);
                if removed.is_some() {
                    info!("peer {device_id} left the network");
                    let _ = events_tx.send(DiscoveryEvent::Lost(device_id)).await;
                }
            }
            ServiceEvent::SearchStarted(_)
            | ServiceEvent::ServiceFound(_, _)
            | ServiceEvent::SearchStopped(_) => {}
        }
    }
}

#[async_trait]
impl Discovery for MdnsDiscovery {
    async fn start(&self) -> SyncResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let service = self.build_service_info()?;
        self.daemon
            .register(service.clone())
            .map_err(|e| SyncError::Discovery(format!("mdns register: {e}")))?;

        let browser = self
            .daemon
            .browse(SERVICE_TYPE)
            .map_err(|e| SyncError::Discovery(format!("mdns browse: {e}")))?;

        let local_id = self.device_id;
        let peers = Arc::clone(&self.peers);
        let events_tx = self.events_tx.clone();
        let running = Arc::clone(&self.running);
        let daemon = self.daemon.clone();

        tokio::spawn(async move {
            let mut readvertise = tokio::time::interval(READVERTISE_INTERVAL);
            readvertise.tick().await; // immediate first tick consumed
            loop {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                tokio::select! {
                    event = browser.recv_async() => {
                        match event {
                            Ok(event) => {
                                Self::handle_event(event, local_id, &peers, &events_tx).await;
                            }
                            Err(_) => {
                                debug!("mdns browse channel closed");
                                break;
                            }
                        }
                    }
                    _ = readvertise.tick() => {
                        if let Err(e) = daemon.register(service.clone()) {
                            warn!("mdns re-advertisement failed: {e}");
                        }
                    }
                }
            }
        });

        info!("mdns discovery started as {}", self.full_name());
        Ok(())
    }

    async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.daemon.unregister(&self.full_name()) {
            warn!("mdns unregister failed: {e}");
        }
        if let Err(e) = self.daemon.shutdown() {
            warn!("mdns shutdown failed: {e}");
        }
        info!("mdns discovery stopped");
    }

    fn local_id(&self) -> DeviceId {
        self.device_id
    }

    fn peers(&self) -> Vec<PeerDevice> {
        let peers = self
            .peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        flag_owner(self.device_id, peers)
    }

    async fn next_event(&self) -> Option<DiscoveryEvent> {
        self.events_rx.lock().await.recv().await
    }
}

/// Best-effort local IPv4 address for service registration.
fn local_ipv4() -> Ipv4Addr {
    use std::net::UdpSocket;
    // Routing probe; no packet is sent.
    let guess = UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| {
            s.connect("224.0.0.251:5353")?;
            s.local_addr()
        })
        .ok()
        .and_then(|addr| match addr.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        });
    guess.unwrap_or(Ipv4Addr::LOCALHOST)
}

// ── Static implementation ────────────────────────────────────────

/// A fixed peer set, for tests and wired single-switch venues where the
/// fleet is known up front.
pub struct StaticDiscovery {
    device_id: DeviceId,
    peers: Arc<RwLock<HashMap<DeviceId, PeerDevice>>>,
    events_tx: mpsc::Sender<DiscoveryEvent>,
    events_rx: Mutex<mpsc::Receiver<DiscoveryEvent>>,
    running: Arc<AtomicBool>,
}

impl StaticDiscovery {
    /// Creates a discovery over a fixed peer set.
    pub fn new(device_id: DeviceId, peers: Vec<PeerDevice>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(64);
        let map = peers.into_iter().map(|p| (p.device_id, p)).collect();
        Self {
            device_id,
            peers: Arc::new(RwLock::new(map)),
            events_tx,
            events_rx: Mutex::new(events_rx),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Injects a peer after start, emitting a Found event. Used by tests
    /// to simulate a device joining mid-service.
    pub async fn inject(&self, peer: PeerDevice) {
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peer.device_id, peer.clone());
        let _ = self.events_tx.send(DiscoveryEvent::Found(peer)).await;
    }

    /// Removes a peer after start, emitting a Lost event.
    pub async fn drop_peer(&self, device_id: DeviceId) {
        let removed = self
            .peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&device_id);
        if removed.is_some() {
            let _ = self.events_tx.send(DiscoveryEvent::Lost(device_id)).await;
        }
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn start(&self) -> SyncResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let peers: Vec<PeerDevice> = self
            .peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for peer in peers {
            let _ = self.events_tx.send(DiscoveryEvent::Found(peer)).await;
        }
        Ok(())
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn local_id(&self) -> DeviceId {
        self.device_id
    }

    fn peers(&self) -> Vec<PeerDevice> {
        let peers = self
            .peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        flag_owner(self.device_id, peers)
    }

    async fn next_event(&self) -> Option<DiscoveryEvent> {
        self.events_rx.lock().await.recv().await
    }
}
