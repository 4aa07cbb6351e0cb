//! Record addressing and the change payload envelope.
//!
//! A sync message's payload is an opaque serialized snapshot of the changed
//! business record. The sync layer reads exactly one thing out of it — the
//! logical record id — so it can key conflict resolution; everything else
//! belongs to the host application.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of business record a change applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// A customer order.
    Order,
    /// A single line item within an order.
    OrderDetail,
    /// A table and its occupancy status.
    Table,
    /// A menu entry.
    Menu,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordKind::Order => "order",
            RecordKind::OrderDetail => "order_detail",
            RecordKind::Table => "table",
            RecordKind::Menu => "menu",
        };
        write!(f, "{name}")
    }
}

/// Addresses one logical record for conflict resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    /// The record kind.
    pub kind: RecordKind,
    /// Application-assigned record identifier (e.g. a table code or an
    /// order-detail id).
    pub id: String,
}

impl RecordKey {
    /// Creates a new record key.
    #[must_use]
    pub fn new(kind: RecordKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// Error raised when a payload cannot be decoded.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    /// The payload is not valid JSON.
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// The serialized body of a change message.
///
/// `record` names the logical record the change applies to; `data` is the
/// full snapshot of the record and is never interpreted by the sync layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangePayload {
    /// Logical record identifier.
    pub record: String,
    /// Opaque record snapshot.
    pub data: serde_json::Value,
}

impl ChangePayload {
    /// Creates a new payload.
    #[must_use]
    pub fn new(record: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            record: record.into(),
            data,
        }
    }

    /// Serializes the payload to its wire representation.
    #[must_use]
    pub fn to_wire(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }

    /// Decodes a payload from its wire representation.
    pub fn from_wire(raw: &str) -> Result<Self, PayloadError> {
        Ok(serde_json::from_str(raw)?)
    }
}
