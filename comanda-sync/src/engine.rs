//! The sync engine.
//!
//! Owns the lifecycle state machine and one supervised task per connected
//! peer. Each peer task drives three concerns through a single select
//! loop: draining that peer's outbox (with per-entry backoff), handling
//! inbound traffic (dedup, resolve, apply, acknowledge), and heartbeating.
//!
//! A stalled peer only ever stalls its own task. Everything safety-
//! critical (outbox, ledger, record tags) lives in the durable store,
//! so the engine tolerates being killed at any instant.

use crate::bridge::PersistenceBridge;
use crate::config::SyncConfig;
use crate::discovery::{Discovery, DiscoveryEvent};
use crate::error::{SyncError, SyncResult};
use crate::peer::PeerDevice;
use crate::protocol::{MessageKind, SyncMessage};
use crate::resolver::{self, Resolution};
use crate::transport::{ChannelTx, PeerChannel, Transport};
use comanda_store::{OutboxEntry, SyncStore};
use comanda_types::{ChangePayload, DeviceId, MessageId, MonotonicClock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Wake-up bound when a peer loop has nothing scheduled.
const IDLE_WAKE: Duration = Duration::from_secs(3600);

/// Lifecycle state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Not initialized; no durable state opened.
    Idle,
    /// Durable state ready; no network activity.
    Initializing,
    /// Discovery and peer loops running.
    Active,
    /// Draining peer loops.
    Stopping,
}

impl EngineState {
    /// Whether peer loops may be running.
    pub fn is_active(&self) -> bool {
        matches!(self, EngineState::Active)
    }
}

/// Read-only aggregate view of sync health.
#[derive(Debug, Clone)]
pub struct SyncStatus {
    /// Last successful sync (a delivery confirmed or a remote change
    /// applied), epoch milliseconds.
    pub last_sync_ms: Option<u64>,
    /// Unacknowledged outbox entries across all peers.
    pub pending_outbox: u64,
    /// Peers with a live channel.
    pub connected_peers: usize,
    /// Errors observed since engine construction.
    pub sync_errors: u64,
}

struct EngineInner {
    device_id: DeviceId,
    config: SyncConfig,
    store: Arc<SyncStore>,
    bridge: Arc<dyn PersistenceBridge>,
    discovery: Arc<dyn Discovery>,
    transport: Arc<dyn Transport>,
    clock: MonotonicClock,
    state: RwLock<EngineState>,
    /// Every peer we know about, connected or not.
    roster: RwLock<HashMap<DeviceId, PeerDevice>>,
    /// Live peer loop handles.
    loops: Mutex<HashMap<DeviceId, JoinHandle<()>>>,
    /// Supervisor handle for the current Active epoch.
    supervisor: Mutex<Option<JoinHandle<()>>>,
    /// Cancellation for the current Active epoch.
    shutdown: RwLock<CancellationToken>,
    /// Wakes peer loops when new outbox entries appear.
    outbox_notify: Notify,
    errors: AtomicU64,
    /// 0 = never synced.
    last_sync_ms: AtomicU64,
    /// First unrecoverable storage failure, if any.
    fatal: RwLock<Option<String>>,
}

impl EngineInner {
    fn now_ms(&self) -> u64 {
        self.clock.wall_ms()
    }

    fn note_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn mark_synced(&self) {
        self.last_sync_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    async fn note_fatal(&self, what: &str, err: &SyncError) {
        error!("unrecoverable storage failure during {what}: {err}");
        let mut fatal = self.fatal.write().await;
        if fatal.is_none() {
            *fatal = Some(format!("{what}: {err}"));
        }
    }
}

/// The venue sync engine.
///
/// All dependencies (transport, discovery, persistence bridge, durable
/// store) are injected, so the conflict and retry logic is testable
/// without real network I/O.
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// Creates an engine. Nothing runs until `initialize` + `start_sync`.
    pub fn new(
        config: SyncConfig,
        store: Arc<SyncStore>,
        bridge: Arc<dyn PersistenceBridge>,
        discovery: Arc<dyn Discovery>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let device_id = transport.local_id();
        Self {
            inner: Arc::new(EngineInner {
                device_id,
                config,
                store,
                bridge,
                discovery,
                transport,
                clock: MonotonicClock::new(),
                state: RwLock::new(EngineState::Idle),
                roster: RwLock::new(HashMap::new()),
                loops: Mutex::new(HashMap::new()),
                supervisor: Mutex::new(None),
                shutdown: RwLock::new(CancellationToken::new()),
                outbox_notify: Notify::new(),
                errors: AtomicU64::new(0),
                last_sync_ms: AtomicU64::new(0),
                fatal: RwLock::new(None),
            }),
        }
    }

    /// Our device id.
    pub fn device_id(&self) -> DeviceId {
        self.inner.device_id
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> EngineState {
        *self.inner.state.read().await
    }

    /// The first unrecoverable storage failure observed, if any.
    pub async fn fatal_error(&self) -> Option<String> {
        self.inner.fatal.read().await.clone()
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Prepares durable state without starting any network activity.
    /// Idempotent; repeated calls in the same state are no-ops.
    pub async fn initialize(&self) -> SyncResult<()> {
        let mut state = self.inner.state.write().await;
        match *state {
            EngineState::Idle => {
                // Probe the store so an unusable ledger/outbox surfaces
                // here, as a fatal condition, instead of inside peer loops.
                self.inner.store.pending_count()?;
                *state = EngineState::Initializing;
                info!("engine initialized (device {})", self.inner.device_id);
                Ok(())
            }
            EngineState::Initializing | EngineState::Active => Ok(()),
            EngineState::Stopping => Err(SyncError::InvalidState {
                from: "Stopping".to_string(),
                to: "initialize".to_string(),
            }),
        }
    }

    /// Starts discovery and spawns peer loops as devices appear.
    pub async fn start_sync(&self) -> SyncResult<()> {
        {
            let mut state = self.inner.state.write().await;
            match *state {
                EngineState::Initializing => *state = EngineState::Active,
                EngineState::Active => return Ok(()),
                other => {
                    return Err(SyncError::InvalidState {
                        from: format!("{other:?}"),
                        to: "Active".to_string(),
                    })
                }
            }
        }

        let token = CancellationToken::new();
        *self.inner.shutdown.write().await = token.clone();

        self.inner.discovery.start().await?;

        let inner = Arc::clone(&self.inner);
        let supervisor = tokio::spawn(run_supervisor(inner, token));
        *self.inner.supervisor.lock().await = Some(supervisor);

        info!("sync started");
        Ok(())
    }

    /// Signals every peer loop to finish its in-flight work and waits up
    /// to the drain timeout. The outbox and ledger stay untouched.
    pub async fn stop_sync(&self) -> SyncResult<()> {
        {
            let mut state = self.inner.state.write().await;
            match *state {
                EngineState::Active => *state = EngineState::Stopping,
                // Stopping concurrently, or nothing running: no-op.
                _ => return Ok(()),
            }
        }

        self.inner.shutdown.read().await.cancel();
        self.inner.discovery.stop().await;

        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        if let Some(supervisor) = self.inner.supervisor.lock().await.take() {
            handles.push(supervisor);
        }
        handles.extend(self.inner.loops.lock().await.drain().map(|(_, h)| h));

        let drained = tokio::time::timeout(
            self.inner.config.drain_timeout,
            futures::future::join_all(handles.iter_mut()),
        )
        .await;
        if drained.is_err() {
            warn!("drain timeout expired; aborting remaining peer loops");
            for handle in &handles {
                handle.abort();
            }
        }

        {
            let mut roster = self.inner.roster.write().await;
            for peer in roster.values_mut() {
                peer.mark_disconnected();
            }
        }

        *self.inner.state.write().await = EngineState::Idle;
        info!("sync stopped");
        Ok(())
    }

    /// Releases transport and discovery resources. Durable state survives
    /// so a later engine picks up exactly where this one stopped.
    pub async fn cleanup(&self) -> SyncResult<()> {
        if self.state().await == EngineState::Active {
            self.stop_sync().await?;
        }
        self.inner.transport.shutdown().await;
        self.inner.discovery.stop().await;
        *self.inner.state.write().await = EngineState::Idle;
        Ok(())
    }

    // ── Local changes ────────────────────────────────────────────

    /// Publishes a local change: assigns the next per-record version,
    /// stamps it, and places it on every known peer's outbox.
    ///
    /// The message is self-marked in the ledger so relayed copies coming
    /// back are acknowledged without reapplying.
    pub async fn publish_local_change(
        &self,
        kind: MessageKind,
        record_id: impl Into<String>,
        data: serde_json::Value,
    ) -> SyncResult<MessageId> {
        let record_id = record_id.into();
        let record_kind = kind.record_kind().ok_or_else(|| {
            SyncError::Protocol(format!("{kind:?} does not carry a record change"))
        })?;
        let key = comanda_types::RecordKey::new(record_kind, record_id.clone());

        let version = self.inner.store.current_version(&key)? + 1;
        let stamp = self.inner.clock.tick();
        let priority = self.inner.config.priorities.rank(kind);
        let payload = ChangePayload::new(record_id, data);
        let message = SyncMessage::change(
            self.inner.device_id,
            kind,
            &payload,
            version,
            stamp,
            priority,
        );
        let tag = message
            .tag()
            .ok_or_else(|| SyncError::Protocol("change without tag".to_string()))?;

        self.inner.store.put_record_tag(&key, &tag)?;
        self.inner
            .store
            .mark_processed(&message.id, self.inner.now_ms())?;

        let wire = serde_json::to_string(&message)?;
        let roster = self.inner.roster.read().await;
        for peer in roster.keys() {
            self.inner.store.enqueue(peer, &message.id, &wire)?;
        }
        drop(roster);

        self.inner.outbox_notify.notify_waiters();
        debug!(
            "published {:?} for {} as version {}",
            kind, key, version
        );
        Ok(message.id)
    }

    // ── Introspection ────────────────────────────────────────────

    /// Recomputes the aggregate status view.
    pub async fn status(&self) -> SyncStatus {
        let connected_peers = self
            .inner
            .roster
            .read()
            .await
            .values()
            .filter(|p| p.connected)
            .count();
        let last = self.inner.last_sync_ms.load(Ordering::Relaxed);
        SyncStatus {
            last_sync_ms: (last != 0).then_some(last),
            pending_outbox: self.inner.store.pending_count().unwrap_or(0),
            connected_peers,
            sync_errors: self.inner.errors.load(Ordering::Relaxed),
        }
    }

    /// Snapshot of every known peer.
    pub async fn peers(&self) -> Vec<PeerDevice> {
        self.inner.roster.read().await.values().cloned().collect()
    }

    /// Permanently removes a peer: forgets it and discards its outbox.
    ///
    /// This is the only path that ever discards undelivered entries;
    /// ordinary disconnects and retry exhaustion always retain them.
    pub async fn remove_peer(&self, device_id: DeviceId) -> SyncResult<()> {
        if let Some(handle) = self.inner.loops.lock().await.remove(&device_id) {
            handle.abort();
        }
        self.inner.roster.write().await.remove(&device_id);
        let removed = self.inner.store.remove_peer(&device_id)?;
        info!("removed peer {device_id} and {removed} queued entries");
        Ok(())
    }
}

// ── Supervisor ───────────────────────────────────────────────────

async fn run_supervisor(inner: Arc<EngineInner>, token: CancellationToken) {
    // Devices already visible when sync starts.
    for peer in inner.discovery.peers() {
        try_connect(&inner, peer, &token).await;
    }

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            event = inner.discovery.next_event() => match event {
                Some(DiscoveryEvent::Found(peer)) | Some(DiscoveryEvent::Updated(peer)) => {
                    try_connect(&inner, peer, &token).await;
                }
                Some(DiscoveryEvent::Lost(device_id)) => {
                    let mut roster = inner.roster.write().await;
                    if let Some(peer) = roster.get_mut(&device_id) {
                        if peer.connected {
                            // Channel still up; keep the entry until the
                            // peer loop notices.
                            debug!("peer {device_id} lost from discovery but still connected");
                        } else {
                            roster.remove(&device_id);
                            info!("peer {device_id} no longer discoverable; forgotten");
                        }
                    }
                }
                None => break,
            },
            accepted = inner.transport.accept() => match accepted {
                Some(channel) => adopt_inbound(&inner, channel, &token).await,
                None => break,
            },
        }
    }
    debug!("supervisor ended");
}

async fn try_connect(inner: &Arc<EngineInner>, peer: PeerDevice, token: &CancellationToken) {
    let device_id = peer.device_id;
    if device_id == inner.device_id {
        return;
    }

    {
        let mut roster = inner.roster.write().await;
        let entry = roster
            .entry(device_id)
            .or_insert_with(|| peer.clone());
        entry.name = peer.name.clone();
        entry.direct_addr = peer.direct_addr.or(entry.direct_addr);
        entry.service_addr = peer.service_addr.or(entry.service_addr);
        entry.group_owner = peer.group_owner;
        entry.touch(inner.now_ms());
    }

    if has_live_loop(inner, device_id).await {
        return;
    }

    match inner.transport.connect(&peer).await {
        Ok(channel) => spawn_peer_loop(inner, channel, token).await,
        Err(e) => {
            debug!("connect to {device_id} failed: {e}");
        }
    }
}

async fn adopt_inbound(
    inner: &Arc<EngineInner>,
    channel: Box<dyn PeerChannel>,
    token: &CancellationToken,
) {
    let device_id = channel.peer();
    if has_live_loop(inner, device_id).await {
        debug!("dropping duplicate inbound channel from {device_id}");
        return;
    }
    {
        let mut roster = inner.roster.write().await;
        roster
            .entry(device_id)
            .or_insert_with(|| PeerDevice::new(device_id, channel.peer_name()));
    }
    spawn_peer_loop(inner, channel, token).await;
}

async fn has_live_loop(inner: &Arc<EngineInner>, device_id: DeviceId) -> bool {
    inner
        .loops
        .lock()
        .await
        .get(&device_id)
        .is_some_and(|handle| !handle.is_finished())
}

async fn spawn_peer_loop(
    inner: &Arc<EngineInner>,
    channel: Box<dyn PeerChannel>,
    token: &CancellationToken,
) {
    let device_id = channel.peer();
    let handle = tokio::spawn(run_peer_loop(
        Arc::clone(inner),
        channel,
        token.child_token(),
    ));
    inner.loops.lock().await.insert(device_id, handle);
}

// ── Per-peer loop ────────────────────────────────────────────────

/// What the outbox wants from this loop iteration.
struct OutboxPlan {
    /// Entries due for (re)transmission now, in enqueue order.
    due: Vec<OutboxEntry>,
    /// Time until the earliest backoff expires, if anything is waiting.
    next_wake: Option<Duration>,
    /// An entry has exhausted its retry budget for this connection.
    exhausted: bool,
}

fn plan_outbox(inner: &EngineInner, peer: &DeviceId) -> SyncResult<OutboxPlan> {
    let pending = inner.store.pending_for_peer(peer)?;
    let now = inner.now_ms();
    let retry = &inner.config.retry;

    let mut plan = OutboxPlan {
        due: Vec::new(),
        next_wake: None,
        exhausted: false,
    };

    for entry in pending {
        if entry.attempts == 0 {
            plan.due.push(entry);
            continue;
        }
        if !retry.allows_attempt(entry.attempts) {
            plan.exhausted = true;
            continue;
        }
        let delay = retry.jittered_delay(entry.attempts - 1).as_millis() as u64;
        let due_at = entry.last_attempt_ms.unwrap_or(0).saturating_add(delay);
        if due_at <= now {
            plan.due.push(entry);
        } else {
            let wait = Duration::from_millis(due_at - now);
            plan.next_wake = Some(plan.next_wake.map_or(wait, |w| w.min(wait)));
        }
    }
    Ok(plan)
}

async fn run_peer_loop(
    inner: Arc<EngineInner>,
    channel: Box<dyn PeerChannel>,
    token: CancellationToken,
) {
    let peer_id = channel.peer();
    let connection = channel.connection_type();
    info!(
        "peer loop started for {} ({}) via {:?}",
        peer_id,
        channel.peer_name(),
        connection
    );

    {
        let mut roster = inner.roster.write().await;
        let peer = roster
            .entry(peer_id)
            .or_insert_with(|| PeerDevice::new(peer_id, channel.peer_name()));
        peer.connected = true;
        peer.connection = connection;
        peer.touch(inner.now_ms());
    }

    // Fresh retry budget for this connection epoch.
    if let Err(e) = inner.store.reset_attempts(&peer_id) {
        inner.note_fatal("reset_attempts", &e.into()).await;
        disconnect_peer(&inner, peer_id).await;
        return;
    }

    let (mut tx, mut rx) = channel.split();

    // Frame reads are not cancel-safe, so a dedicated task owns the
    // receiving half and feeds a channel the select loop can drop freely.
    let (inbound_tx, mut inbound) = tokio::sync::mpsc::channel::<SyncResult<SyncMessage>>(16);
    let reader = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(Some(message)) => {
                    if inbound_tx.send(Ok(message)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = inbound_tx.send(Err(e)).await;
                    break;
                }
            }
        }
    });

    let mut heartbeat = tokio::time::interval(inner.config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_traffic = Instant::now();

    'peer: loop {
        let plan = match plan_outbox(&inner, &peer_id) {
            Ok(plan) => plan,
            Err(e) => {
                inner.note_fatal("plan_outbox", &e).await;
                break 'peer;
            }
        };

        if plan.exhausted {
            info!(
                "peer {peer_id} presumed unreachable after {} attempts; retaining outbox",
                inner.config.retry.max_attempts
            );
            break 'peer;
        }

        let had_due = !plan.due.is_empty();
        for entry in plan.due {
            let message: SyncMessage = match serde_json::from_str(&entry.message) {
                Ok(m) => m,
                Err(e) => {
                    // A row that cannot decode can never be delivered.
                    error!("undecodable outbox row {} dropped: {e}", entry.id);
                    inner.note_error();
                    let _ = inner.store.mark_acked(&peer_id, &entry.message_id);
                    continue;
                }
            };
            let sent =
                tokio::time::timeout(inner.config.send_timeout, tx.send(&message)).await;
            match sent {
                Ok(Ok(())) => {
                    debug!(
                        "sent {:?} {} to {peer_id} (attempt {})",
                        message.kind,
                        message.id,
                        entry.attempts + 1
                    );
                    if let Err(e) = inner.store.record_attempt(entry.id, inner.now_ms()) {
                        inner.note_fatal("record_attempt", &e.into()).await;
                        break 'peer;
                    }
                }
                Ok(Err(e)) => {
                    warn!("send to {peer_id} failed: {e}");
                    inner.note_error();
                    break 'peer;
                }
                Err(_) => {
                    warn!("send to {peer_id} timed out");
                    inner.note_error();
                    break 'peer;
                }
            }
        }

        if had_due {
            // Attempts were just recorded; re-plan so the next backoff
            // wake reflects them.
            continue 'peer;
        }

        let wake = plan.next_wake.unwrap_or(IDLE_WAKE);
        tokio::select! {
            _ = token.cancelled() => break 'peer,

            _ = heartbeat.tick() => {
                if last_traffic.elapsed() > inner.config.liveness_timeout {
                    warn!("peer {peer_id} silent past liveness timeout; disconnecting");
                    break 'peer;
                }
                let beat = SyncMessage::heartbeat(inner.device_id, inner.now_ms());
                let sent = tokio::time::timeout(inner.config.send_timeout, tx.send(&beat)).await;
                if !matches!(sent, Ok(Ok(()))) {
                    warn!("heartbeat to {peer_id} failed");
                    inner.note_error();
                    break 'peer;
                }
            }

            incoming = inbound.recv() => match incoming {
                Some(Ok(message)) => {
                    last_traffic = Instant::now();
                    {
                        let mut roster = inner.roster.write().await;
                        if let Some(peer) = roster.get_mut(&peer_id) {
                            peer.touch(inner.now_ms());
                        }
                    }
                    if let Err(e) = handle_incoming(&inner, peer_id, message, &mut tx).await {
                        if matches!(e, SyncError::Storage(_)) {
                            inner.note_fatal("handle_incoming", &e).await;
                            break 'peer;
                        }
                        warn!("error handling message from {peer_id}: {e}");
                    }
                }
                Some(Err(e)) => {
                    warn!("receive from {peer_id} failed: {e}");
                    inner.note_error();
                    break 'peer;
                }
                None => {
                    info!("peer {peer_id} closed the channel");
                    break 'peer;
                }
            },

            _ = inner.outbox_notify.notified() => {
                // New outbox entries; re-plan immediately.
            }

            _ = tokio::time::sleep(wake) => {
                // Earliest backoff expired; re-plan.
            }
        }
    }

    reader.abort();
    tx.close().await;
    disconnect_peer(&inner, peer_id).await;
    info!("peer loop ended for {peer_id}; outbox retained");
}

async fn disconnect_peer(inner: &EngineInner, peer_id: DeviceId) {
    let mut roster = inner.roster.write().await;
    if let Some(peer) = roster.get_mut(&peer_id) {
        peer.mark_disconnected();
    }
}

// ── Inbound handling ─────────────────────────────────────────────

async fn handle_incoming(
    inner: &Arc<EngineInner>,
    peer_id: DeviceId,
    message: SyncMessage,
    tx: &mut Box<dyn ChannelTx>,
) -> SyncResult<()> {
    match message.kind {
        MessageKind::Heartbeat => Ok(()),
        MessageKind::Ack => {
            let acked = message.acked_id()?;
            if inner.store.mark_acked(&peer_id, &acked)? {
                debug!("peer {peer_id} acknowledged {acked}");
                inner.mark_synced();
            }
            Ok(())
        }
        _ => handle_change(inner, peer_id, message, tx).await,
    }
}

async fn handle_change(
    inner: &Arc<EngineInner>,
    peer_id: DeviceId,
    message: SyncMessage,
    tx: &mut Box<dyn ChannelTx>,
) -> SyncResult<()> {
    // Corrupt messages are dropped without an ack so the sender retries.
    if let Err(e) = message.verify_checksum() {
        warn!("integrity error from {peer_id}: {e}");
        inner.note_error();
        return Ok(());
    }

    // Already applied: acknowledge and discard. This is the expected
    // steady state for retries and relayed copies, not an error.
    if inner.store.is_processed(&message.id)? {
        debug!("duplicate {} from {peer_id}; re-acking", message.id);
        send_ack(inner, &message, tx).await;
        return Ok(());
    }

    let key = match message.record_key() {
        Ok(key) => key,
        Err(e) => {
            warn!("malformed payload from {peer_id}: {e}");
            inner.note_error();
            return Ok(());
        }
    };
    let Some(tag) = message.tag() else {
        warn!("change {} from {peer_id} carries no version tag", message.id);
        inner.note_error();
        return Ok(());
    };

    let local = inner.store.record_tag(&key)?;
    match resolver::resolve(local.as_ref(), &tag) {
        Resolution::Apply => {
            let bridge = Arc::clone(&inner.bridge);
            let record_kind = key.kind;
            let kind = message.kind;
            let payload = message.payload.clone();
            let applied = tokio::task::spawn_blocking(move || {
                bridge.apply_change(record_kind, kind, &payload)
            })
            .await;

            match applied {
                Ok(Ok(())) => {
                    inner
                        .store
                        .commit_applied(&message.id, inner.now_ms(), &key, &tag)?;
                    debug!("applied {:?} {} for {key}", message.kind, message.id);
                    inner.mark_synced();
                    relay(inner, &message, peer_id).await?;
                    send_ack(inner, &message, tx).await;
                }
                Ok(Err(e)) => {
                    // Not recorded, not acked; the sender will retry.
                    warn!("apply of {} failed: {e}", message.id);
                    inner.note_error();
                }
                Err(e) => {
                    warn!("apply of {} panicked: {e}", message.id);
                    inner.note_error();
                }
            }
        }
        Resolution::Discard => {
            // The held value wins; record the message so replays are
            // cheap, and acknowledge it.
            debug!(
                "discarding {} for {key}: held tag wins",
                message.id
            );
            inner
                .store
                .mark_processed(&message.id, inner.now_ms())?;
            send_ack(inner, &message, tx).await;
        }
    }
    Ok(())
}

/// Forwards an applied change to every other known peer (store-and-
/// forward mesh). Receiver-side ledgers make this loop-safe.
async fn relay(
    inner: &Arc<EngineInner>,
    message: &SyncMessage,
    received_from: DeviceId,
) -> SyncResult<()> {
    let wire = serde_json::to_string(message)?;
    let roster = inner.roster.read().await;
    let mut relayed = 0;
    for peer in roster.keys() {
        if *peer == received_from || *peer == message.sender {
            continue;
        }
        inner.store.enqueue(peer, &message.id, &wire)?;
        relayed += 1;
    }
    drop(roster);
    if relayed > 0 {
        debug!("relayed {} to {relayed} peers", message.id);
        inner.outbox_notify.notify_waiters();
    }
    Ok(())
}

async fn send_ack(inner: &Arc<EngineInner>, message: &SyncMessage, tx: &mut Box<dyn ChannelTx>) {
    let ack = SyncMessage::ack(inner.device_id, message.id, inner.now_ms());
    let sent = tokio::time::timeout(inner.config.send_timeout, tx.send(&ack)).await;
    if !matches!(sent, Ok(Ok(()))) {
        // The sender simply retries the message later.
        warn!("failed to ack {}", message.id);
    }
}
