//! Transport layer.
//!
//! One bidirectional message channel per connected peer. A channel
//! guarantees ordered, reliable delivery while it stays open, and
//! nothing across re-establishment. End-to-end ordering belongs to the
//! engine's version metadata, never to wire order.
//!
//! `TcpTransport` carries both underlying mechanisms: a dial first goes to
//! the peer's advertised direct endpoint, and only after that fails does
//! it fall back to the service-discovery address. The dialing side reports
//! which mechanism won in its hello frame.

use crate::codec;
use crate::error::{SyncError, SyncResult};
use crate::peer::{ConnectionType, PeerDevice};
use crate::protocol::{HelloFrame, SyncMessage, PROTOCOL_VERSION};
use async_trait::async_trait;
use comanda_types::DeviceId;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Hello frame extended with the mechanism the dialer used.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TcpHello {
    #[serde(flatten)]
    hello: HelloFrame,
    via: ConnectionType,
}

/// Sending half of a peer channel.
#[async_trait]
pub trait ChannelTx: Send {
    /// Sends one message.
    async fn send(&mut self, message: &SyncMessage) -> SyncResult<()>;

    /// Closes the channel.
    async fn close(&mut self);
}

/// Receiving half of a peer channel.
#[async_trait]
pub trait ChannelRx: Send {
    /// Receives the next message. `Ok(None)` means the peer closed the
    /// channel cleanly.
    async fn recv(&mut self) -> SyncResult<Option<SyncMessage>>;
}

/// An established bidirectional channel to one peer.
pub trait PeerChannel: Send {
    /// The remote device.
    fn peer(&self) -> DeviceId;

    /// The remote device's display name, if it identified itself.
    fn peer_name(&self) -> &str;

    /// Which mechanism carries this channel.
    fn connection_type(&self) -> ConnectionType;

    /// Splits into independently driven halves.
    fn split(self: Box<Self>) -> (Box<dyn ChannelTx>, Box<dyn ChannelRx>);
}

/// Opens channels to peers and accepts channels from them.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Our device id.
    fn local_id(&self) -> DeviceId;

    /// Dials a peer, trying the primary mechanism before the fallback.
    async fn connect(&self, peer: &PeerDevice) -> SyncResult<Box<dyn PeerChannel>>;

    /// Waits for the next inbound channel. Returns `None` after shutdown.
    async fn accept(&self) -> Option<Box<dyn PeerChannel>>;

    /// Releases all transport resources.
    async fn shutdown(&self);
}

// ── TCP implementation ───────────────────────────────────────────

/// Configuration for the TCP transport.
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Address to listen on; port 0 picks an ephemeral port.
    pub listen_addr: SocketAddr,
    /// Bound on a single connect attempt, per mechanism.
    pub connect_timeout: Duration,
    /// Bound on the hello exchange.
    pub handshake_timeout: Duration,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:0".parse().expect("static addr"),
            connect_timeout: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(3),
        }
    }
}

/// TCP transport: direct dials with service-discovery fallback.
pub struct TcpTransport {
    device_id: DeviceId,
    device_name: String,
    config: TcpTransportConfig,
    local_addr: SocketAddr,
    incoming_rx: Mutex<mpsc::Receiver<Box<dyn PeerChannel>>>,
    shutdown: CancellationToken,
}

impl TcpTransport {
    /// Binds the listener and starts accepting inbound channels.
    pub async fn bind(
        device_id: DeviceId,
        device_name: impl Into<String>,
        config: TcpTransportConfig,
    ) -> SyncResult<Self> {
        let device_name = device_name.into();
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(|e| SyncError::Network(format!("bind {}: {e}", config.listen_addr)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| SyncError::Network(format!("local addr: {e}")))?;

        let (incoming_tx, incoming_rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();

        let accept_shutdown = shutdown.clone();
        let accept_name = device_name.clone();
        let handshake_timeout = config.handshake_timeout;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_shutdown.cancelled() => break,
                    accepted = listener.accept() => {
                        let (stream, remote) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                warn!("accept failed: {e}");
                                continue;
                            }
                        };
                        debug!("inbound connection from {remote}");
                        match accept_handshake(stream, device_id, &accept_name, handshake_timeout)
                            .await
                        {
                            Ok(channel) => {
                                if incoming_tx.send(Box::new(channel) as Box<dyn PeerChannel>)
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                            Err(e) => warn!("handshake with {remote} failed: {e}"),
                        }
                    }
                }
            }
            debug!("accept loop ended");
        });

        info!("transport listening on {local_addr}");
        Ok(Self {
            device_id,
            device_name,
            config,
            local_addr,
            incoming_rx: Mutex::new(incoming_rx),
            shutdown,
        })
    }

    /// The bound listen address (for discovery advertisement).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn dial(&self, addr: SocketAddr, via: ConnectionType) -> SyncResult<TcpChannel> {
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| SyncError::Timeout)?
            .map_err(|e| SyncError::Network(format!("connect {addr}: {e}")))?;

        let hello = TcpHello {
            hello: HelloFrame::new(self.device_id, &self.device_name),
            via,
        };

        let (mut reader, mut writer) = stream.into_split();
        let theirs = tokio::time::timeout(self.config.handshake_timeout, async {
            codec::write_frame(&mut writer, &hello).await?;
            codec::read_frame::<TcpHello, _>(&mut reader).await
        })
        .await
        .map_err(|_| SyncError::Timeout)?
        .map_err(|e| SyncError::Network(format!("handshake: {e}")))?
        .ok_or(SyncError::ChannelClosed)?;

        if theirs.hello.version != PROTOCOL_VERSION {
            return Err(SyncError::Protocol(format!(
                "protocol version mismatch: expected {PROTOCOL_VERSION}, got {}",
                theirs.hello.version
            )));
        }

        Ok(TcpChannel {
            peer: theirs.hello.device_id,
            peer_name: theirs.hello.device_name,
            connection: via,
            reader,
            writer,
        })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_id(&self) -> DeviceId {
        self.device_id
    }

    async fn connect(&self, peer: &PeerDevice) -> SyncResult<Box<dyn PeerChannel>> {
        let mut attempts: Vec<(SocketAddr, ConnectionType)> = Vec::new();
        if let Some(addr) = peer.direct_addr {
            attempts.push((addr, ConnectionType::Direct));
        }
        if let Some(addr) = peer.service_addr {
            attempts.push((addr, ConnectionType::ServiceDiscovery));
        }
        if attempts.is_empty() {
            return Err(SyncError::Network(format!(
                "peer {} has no known address",
                peer.device_id
            )));
        }

        let mut last_error = SyncError::Network("unreachable".to_string());
        for (addr, via) in attempts {
            match self.dial(addr, via).await {
                Ok(channel) => {
                    if channel.peer != peer.device_id {
                        warn!(
                            "dialed {} but {} answered",
                            peer.device_id, channel.peer
                        );
                    }
                    info!("connected to {} via {:?}", channel.peer, via);
                    return Ok(Box::new(channel));
                }
                Err(e) => {
                    debug!("dial {addr} ({via:?}) failed: {e}");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    async fn accept(&self) -> Option<Box<dyn PeerChannel>> {
        self.incoming_rx.lock().await.recv().await
    }

    async fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

async fn accept_handshake(
    stream: TcpStream,
    device_id: DeviceId,
    device_name: &str,
    timeout: Duration,
) -> SyncResult<TcpChannel> {
    let (mut reader, mut writer) = stream.into_split();

    let theirs = tokio::time::timeout(timeout, codec::read_frame::<TcpHello, _>(&mut reader))
        .await
        .map_err(|_| SyncError::Timeout)?
        .map_err(|e| SyncError::Network(format!("handshake read: {e}")))?
        .ok_or(SyncError::ChannelClosed)?;

    if theirs.hello.version != PROTOCOL_VERSION {
        return Err(SyncError::Protocol(format!(
            "protocol version mismatch: expected {PROTOCOL_VERSION}, got {}",
            theirs.hello.version
        )));
    }

    let ours = TcpHello {
        hello: HelloFrame::new(device_id, device_name),
        via: theirs.via,
    };
    tokio::time::timeout(timeout, codec::write_frame(&mut writer, &ours))
        .await
        .map_err(|_| SyncError::Timeout)?
        .map_err(|e| SyncError::Network(format!("handshake write: {e}")))?;

    Ok(TcpChannel {
        peer: theirs.hello.device_id,
        peer_name: theirs.hello.device_name,
        connection: theirs.via,
        reader,
        writer,
    })
}

struct TcpChannel {
    peer: DeviceId,
    peer_name: String,
    connection: ConnectionType,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
}

impl PeerChannel for TcpChannel {
    fn peer(&self) -> DeviceId {
        self.peer
    }

    fn peer_name(&self) -> &str {
        &self.peer_name
    }

    fn connection_type(&self) -> ConnectionType {
        self.connection
    }

    fn split(self: Box<Self>) -> (Box<dyn ChannelTx>, Box<dyn ChannelRx>) {
        (
            Box::new(TcpTx {
                writer: self.writer,
            }),
            Box::new(TcpRx {
                reader: self.reader,
            }),
        )
    }
}

struct TcpTx {
    writer: OwnedWriteHalf,
}

#[async_trait]
impl ChannelTx for TcpTx {
    async fn send(&mut self, message: &SyncMessage) -> SyncResult<()> {
        codec::write_frame(&mut self.writer, message)
            .await
            .map_err(|e| SyncError::Network(format!("send: {e}")))
    }

    async fn close(&mut self) {
        use tokio::io::AsyncWriteExt;
        let _ = self.writer.shutdown().await;
    }
}

struct TcpRx {
    reader: OwnedReadHalf,
}

#[async_trait]
impl ChannelRx for TcpRx {
    async fn recv(&mut self) -> SyncResult<Option<SyncMessage>> {
        codec::read_frame(&mut self.reader)
            .await
            .map_err(|e| SyncError::Network(format!("recv: {e}")))
    }
}

// ── Mock implementation ──────────────────────────────────────────

/// In-memory transport for engine tests.
pub mod mock {
    use super::*;
    use std::collections::HashMap;

    /// One end of an in-memory channel pair.
    pub struct MockChannel {
        peer: DeviceId,
        peer_name: String,
        connection: ConnectionType,
        tx: mpsc::Sender<SyncMessage>,
        rx: mpsc::Receiver<SyncMessage>,
    }

    impl MockChannel {
        /// Creates a connected pair. The first end sees `b` as its peer,
        /// the second sees `a`.
        pub fn pair(a: DeviceId, b: DeviceId) -> (MockChannel, MockChannel) {
            Self::pair_via(a, b, ConnectionType::Direct)
        }

        /// Creates a connected pair with an explicit mechanism tag.
        pub fn pair_via(
            a: DeviceId,
            b: DeviceId,
            connection: ConnectionType,
        ) -> (MockChannel, MockChannel) {
            let (a_tx, b_rx) = mpsc::channel(64);
            let (b_tx, a_rx) = mpsc::channel(64);
            (
                MockChannel {
                    peer: b,
                    peer_name: format!("device-{b}"),
                    connection,
                    tx: a_tx,
                    rx: a_rx,
                },
                MockChannel {
                    peer: a,
                    peer_name: format!("device-{a}"),
                    connection,
                    tx: b_tx,
                    rx: b_rx,
                },
            )
        }

        /// Sends a message into the pair (test-harness side).
        pub async fn push(&mut self, message: SyncMessage) -> SyncResult<()> {
            self.tx
                .send(message)
                .await
                .map_err(|_| SyncError::ChannelClosed)
        }

        /// Receives the next message (test-harness side).
        pub async fn pull(&mut self) -> Option<SyncMessage> {
            self.rx.recv().await
        }

        /// Receives with a bound, for tests that expect silence.
        pub async fn pull_timeout(&mut self, wait: Duration) -> Option<SyncMessage> {
            tokio::time::timeout(wait, self.rx.recv()).await.ok()?
        }
    }

    impl PeerChannel for MockChannel {
        fn peer(&self) -> DeviceId {
            self.peer
        }

        fn peer_name(&self) -> &str {
            &self.peer_name
        }

        fn connection_type(&self) -> ConnectionType {
            self.connection
        }

        fn split(self: Box<Self>) -> (Box<dyn ChannelTx>, Box<dyn ChannelRx>) {
            (
                Box::new(MockTx { tx: self.tx }),
                Box::new(MockRx { rx: self.rx }),
            )
        }
    }

    struct MockTx {
        tx: mpsc::Sender<SyncMessage>,
    }

    #[async_trait]
    impl ChannelTx for MockTx {
        async fn send(&mut self, message: &SyncMessage) -> SyncResult<()> {
            self.tx
                .send(message.clone())
                .await
                .map_err(|_| SyncError::ChannelClosed)
        }

        async fn close(&mut self) {}
    }

    struct MockRx {
        rx: mpsc::Receiver<SyncMessage>,
    }

    #[async_trait]
    impl ChannelRx for MockRx {
        async fn recv(&mut self) -> SyncResult<Option<SyncMessage>> {
            Ok(self.rx.recv().await)
        }
    }

    /// Transport whose outbound channels are staged by the test harness.
    pub struct MockTransport {
        local: DeviceId,
        staged: Mutex<HashMap<DeviceId, Vec<MockChannel>>>,
        incoming_tx: mpsc::Sender<Box<dyn PeerChannel>>,
        incoming_rx: Mutex<mpsc::Receiver<Box<dyn PeerChannel>>>,
    }

    impl MockTransport {
        /// Creates an empty mock transport.
        pub fn new(local: DeviceId) -> Self {
            let (incoming_tx, incoming_rx) = mpsc::channel(16);
            Self {
                local,
                staged: Mutex::new(HashMap::new()),
                incoming_tx,
                incoming_rx: Mutex::new(incoming_rx),
            }
        }

        /// Stages the engine-side end of a channel pair for the next
        /// `connect` to the given peer.
        pub async fn stage(&self, peer: DeviceId, channel: MockChannel) {
            self.staged.lock().await.entry(peer).or_default().push(channel);
        }

        /// Delivers an inbound channel, as if the peer had dialed us.
        pub async fn push_incoming(&self, channel: MockChannel) {
            let _ = self.incoming_tx.send(Box::new(channel)).await;
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        fn local_id(&self) -> DeviceId {
            self.local
        }

        async fn connect(&self, peer: &PeerDevice) -> SyncResult<Box<dyn PeerChannel>> {
            let mut staged = self.staged.lock().await;
            match staged.get_mut(&peer.device_id).and_then(|v| {
                if v.is_empty() {
                    None
                } else {
                    Some(v.remove(0))
                }
            }) {
                Some(channel) => Ok(Box::new(channel)),
                None => Err(SyncError::Network(format!(
                    "peer {} unreachable",
                    peer.device_id
                ))),
            }
        }

        async fn accept(&self) -> Option<Box<dyn PeerChannel>> {
            self.incoming_rx.lock().await.recv().await
        }

        async fn shutdown(&self) {}
    }
}
