//! Wire protocol: the message envelope and its integrity rules.
//!
//! Every field a device needs to replicate a change travels in one
//! immutable envelope. Ordering decisions never come from wire order or
//! wall clocks, only from the envelope's own version metadata, so any
//! permutation of deliveries converges.

use crate::error::{SyncError, SyncResult};
use comanda_types::{ChangePayload, DeviceId, LocalStamp, MessageId, RecordKey, RecordKind, VersionTag};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Protocol version exchanged in channel hellos.
pub const PROTOCOL_VERSION: u32 = 1;

/// The closed set of message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    /// A new order was created.
    OrderCreate,
    /// An order was updated.
    OrderUpdate,
    /// An order was deleted.
    OrderDelete,
    /// A single order line item was updated.
    OrderDetailUpdate,
    /// A table changed status.
    TableStatusUpdate,
    /// The kitchen claimed an order line item.
    ChiefClaim,
    /// A menu entry changed.
    MenuUpdate,
    /// Liveness probe; carries no change.
    Heartbeat,
    /// Acknowledgment of a processed message.
    Ack,
}

impl MessageKind {
    /// Whether this kind carries a record change.
    pub fn is_change(&self) -> bool {
        !matches!(self, MessageKind::Heartbeat | MessageKind::Ack)
    }

    /// Whether the envelope must carry a checksum.
    pub fn requires_checksum(&self) -> bool {
        self.is_change()
    }

    /// The record kind a change of this kind applies to.
    pub fn record_kind(&self) -> Option<RecordKind> {
        match self {
            MessageKind::OrderCreate | MessageKind::OrderUpdate | MessageKind::OrderDelete => {
                Some(RecordKind::Order)
            }
            MessageKind::OrderDetailUpdate | MessageKind::ChiefClaim => {
                Some(RecordKind::OrderDetail)
            }
            MessageKind::TableStatusUpdate => Some(RecordKind::Table),
            MessageKind::MenuUpdate => Some(RecordKind::Menu),
            MessageKind::Heartbeat | MessageKind::Ack => None,
        }
    }
}

/// The unit of replication.
///
/// Immutable once constructed; never mutated after send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    /// Globally unique message identifier.
    pub id: MessageId,
    /// The originating device.
    pub sender: DeviceId,
    /// Message kind.
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Serialized record snapshot (opaque; empty for heartbeats).
    pub payload: String,
    /// Sender-local wall clock at origin, epoch milliseconds. Advisory
    /// only; never used for cross-device ordering.
    pub timestamp: u64,
    /// Per-record monotonic version assigned by the originator.
    pub version: u64,
    /// Hex SHA-256 of the payload bytes. Required for every kind except
    /// HEARTBEAT and ACK.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Sender-local monotonic counter; tie-break seed only.
    pub counter: u64,
    /// Domain-assigned priority rank.
    #[serde(default)]
    pub priority: i64,
}

impl SyncMessage {
    /// Builds a change message, computing its checksum.
    pub fn change(
        sender: DeviceId,
        kind: MessageKind,
        payload: &ChangePayload,
        version: u64,
        stamp: LocalStamp,
        priority: i64,
    ) -> Self {
        let payload = payload.to_wire();
        let checksum = payload_checksum(&payload);
        Self {
            id: MessageId::new(),
            sender,
            kind,
            payload,
            timestamp: stamp.wall_ms,
            version,
            checksum: Some(checksum),
            counter: stamp.counter,
            priority,
        }
    }

    /// Builds a heartbeat.
    pub fn heartbeat(sender: DeviceId, now_ms: u64) -> Self {
        Self {
            id: MessageId::new(),
            sender,
            kind: MessageKind::Heartbeat,
            payload: String::new(),
            timestamp: now_ms,
            version: 0,
            checksum: None,
            counter: 0,
            priority: 0,
        }
    }

    /// Builds an acknowledgment for a processed message. The payload
    /// carries the acknowledged message id.
    pub fn ack(sender: DeviceId, acked: MessageId, now_ms: u64) -> Self {
        Self {
            id: MessageId::new(),
            sender,
            kind: MessageKind::Ack,
            payload: acked.to_string(),
            timestamp: now_ms,
            version: 0,
            checksum: None,
            counter: 0,
            priority: 0,
        }
    }

    /// For an ACK, the message id being acknowledged.
    pub fn acked_id(&self) -> SyncResult<MessageId> {
        if self.kind != MessageKind::Ack {
            return Err(SyncError::Protocol(format!(
                "acked_id on a {:?} message",
                self.kind
            )));
        }
        self.payload
            .parse()
            .map_err(|e| SyncError::Protocol(format!("bad ack payload: {e}")))
    }

    /// Verifies the payload checksum.
    ///
    /// Heartbeats and acks are exempt. A change message with a missing or
    /// mismatched checksum is corrupt.
    pub fn verify_checksum(&self) -> SyncResult<()> {
        if !self.kind.requires_checksum() {
            return Ok(());
        }
        let expected = payload_checksum(&self.payload);
        match self.checksum.as_deref() {
            Some(found) if found == expected => Ok(()),
            _ => Err(SyncError::ChecksumMismatch {
                message_id: self.id.to_string(),
            }),
        }
    }

    /// The conflict-resolution tag of this message, if it is a change.
    pub fn tag(&self) -> Option<VersionTag> {
        if !self.kind.is_change() {
            return None;
        }
        Some(VersionTag::new(
            self.priority,
            self.version,
            self.counter,
            self.checksum.clone().unwrap_or_default(),
        ))
    }

    /// The record this change applies to, read from the payload envelope.
    pub fn record_key(&self) -> SyncResult<RecordKey> {
        let kind = self
            .kind
            .record_kind()
            .ok_or_else(|| SyncError::Protocol(format!("{:?} carries no record", self.kind)))?;
        let payload = ChangePayload::from_wire(&self.payload)
            .map_err(|e| SyncError::Protocol(format!("unreadable payload: {e}")))?;
        Ok(RecordKey::new(kind, payload.record))
    }
}

/// Computes the hex SHA-256 checksum of a payload.
pub fn payload_checksum(payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hello frame exchanged when a channel opens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloFrame {
    /// Protocol version of the dialing device.
    pub version: u32,
    /// The dialing device's id.
    pub device_id: DeviceId,
    /// The dialing device's display name.
    pub device_name: String,
}

impl HelloFrame {
    /// Creates a hello frame for this device.
    pub fn new(device_id: DeviceId, device_name: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            device_id,
            device_name: device_name.into(),
        }
    }
}
