//! Persistence bridge: the seam to business-entity storage.
//!
//! The engine never writes orders or tables itself; it hands the winning
//! payload to the host application through this trait. Implementations
//! are blocking (the engine drives them through `spawn_blocking`) and
//! must tolerate the same change arriving more than once: a whole-record
//! snapshot write is naturally idempotent.

use crate::protocol::MessageKind;
use comanda_types::RecordKind;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

/// Error returned by a bridge apply.
#[derive(Debug, Error)]
#[error("persistence apply failed: {0}")]
pub struct BridgeError(pub String);

/// Applies resolved changes to local business-entity storage.
pub trait PersistenceBridge: Send + Sync {
    /// Applies one change. `record_kind` names the entity family; the
    /// payload is the application's own serialized record snapshot.
    fn apply_change(
        &self,
        record_kind: RecordKind,
        kind: MessageKind,
        payload: &str,
    ) -> Result<(), BridgeError>;
}

/// An in-memory bridge for tests.
///
/// Stores the latest payload per record id and can be armed to fail the
/// next N applies.
#[derive(Default)]
pub struct MemoryBridge {
    records: Mutex<HashMap<String, String>>,
    applied: Mutex<Vec<(MessageKind, String)>>,
    fail_next: Mutex<u32>,
}

impl MemoryBridge {
    /// Creates an empty bridge.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` applies fail.
    pub fn fail_next(&self, n: u32) {
        *self.fail_next.lock().unwrap() = n;
    }

    /// Returns the latest stored payload for a record id.
    pub fn record(&self, record_id: &str) -> Option<String> {
        self.records.lock().unwrap().get(record_id).cloned()
    }

    /// Every apply in order, for assertions.
    pub fn applied(&self) -> Vec<(MessageKind, String)> {
        self.applied.lock().unwrap().clone()
    }

    /// Number of applies performed.
    pub fn apply_count(&self) -> usize {
        self.applied.lock().unwrap().len()
    }
}

impl PersistenceBridge for MemoryBridge {
    fn apply_change(
        &self,
        _record_kind: RecordKind,
        kind: MessageKind,
        payload: &str,
    ) -> Result<(), BridgeError> {
        {
            let mut fail = self.fail_next.lock().unwrap();
            if *fail > 0 {
                *fail -= 1;
                return Err(BridgeError("armed failure".to_string()));
            }
        }

        if let Ok(change) = comanda_types::ChangePayload::from_wire(payload) {
            self.records
                .lock()
                .unwrap()
                .insert(change.record, payload.to_string());
        }
        self.applied
            .lock()
            .unwrap()
            .push((kind, payload.to_string()));
        Ok(())
    }
}
