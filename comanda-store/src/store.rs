//! SQLite-backed sync store.
//!
//! Uses a single file so that "applied" and "recorded in the ledger" can
//! commit in one transaction. All ids are stored as their string form.

use crate::error::{StoreError, StoreResult};
use comanda_types::{DeviceId, MessageId, RecordKey, RecordKind, VersionTag};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// One pending outbox row.
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    /// Row id; outbox order is row-id order (enqueue order).
    pub id: i64,
    /// The peer this entry is addressed to.
    pub peer: DeviceId,
    /// Identifier of the enclosed message.
    pub message_id: MessageId,
    /// Serialized wire form of the message.
    pub message: String,
    /// Number of send attempts so far.
    pub attempts: u32,
    /// Epoch milliseconds of the last attempt, if any.
    pub last_attempt_ms: Option<u64>,
}

/// Durable sync state: ledger, outbox and record registry.
pub struct SyncStore {
    conn: Arc<Mutex<Connection>>,
}

impl SyncStore {
    /// Opens (or creates) a store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Opens an in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS ledger (
                message_id TEXT PRIMARY KEY,
                processed_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS outbox (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                peer_id TEXT NOT NULL,
                message_id TEXT NOT NULL,
                message TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_attempt INTEGER,
                UNIQUE(peer_id, message_id)
            );

            CREATE INDEX IF NOT EXISTS outbox_pending
                ON outbox (peer_id);

            CREATE TABLE IF NOT EXISTS records (
                record_kind TEXT NOT NULL,
                record_id TEXT NOT NULL,
                priority INTEGER NOT NULL,
                version INTEGER NOT NULL,
                counter INTEGER NOT NULL,
                checksum TEXT NOT NULL,
                UNIQUE(record_kind, record_id)
            );
            ",
        )?;
        Ok(())
    }

    // ── Ledger ───────────────────────────────────────────────────

    /// Returns true if a message has already been applied.
    pub fn is_processed(&self, message_id: &MessageId) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM ledger WHERE message_id = ?1",
                params![message_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Records a message as processed without touching the record registry.
    ///
    /// Used for locally published messages (echo protection) and for
    /// incoming updates that lost conflict resolution.
    pub fn mark_processed(&self, message_id: &MessageId, now_ms: u64) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT OR IGNORE INTO ledger (message_id, processed_at) VALUES (?1, ?2)",
            params![message_id.to_string(), now_ms as i64],
        )?;
        Ok(())
    }

    /// Commits an applied message: ledger row plus record-registry upsert
    /// in one transaction, so a crash can never record one without the
    /// other.
    pub fn commit_applied(
        &self,
        message_id: &MessageId,
        now_ms: u64,
        record: &RecordKey,
        tag: &VersionTag,
    ) -> StoreResult<()> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO ledger (message_id, processed_at) VALUES (?1, ?2)",
            params![message_id.to_string(), now_ms as i64],
        )?;
        tx.execute(
            "INSERT INTO records (record_kind, record_id, priority, version, counter, checksum)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(record_kind, record_id) DO UPDATE SET
                 priority = excluded.priority,
                 version = excluded.version,
                 counter = excluded.counter,
                 checksum = excluded.checksum",
            params![
                record.kind.to_string(),
                record.id,
                tag.priority,
                tag.version as i64,
                tag.counter as i64,
                tag.checksum,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Number of ledger entries.
    pub fn processed_count(&self) -> StoreResult<usize> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM ledger", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Deletes ledger entries processed before the cutoff.
    ///
    /// Called by an external retention job (30-day window); the engine
    /// never depends on this running.
    pub fn purge_processed_before(&self, cutoff_ms: u64) -> StoreResult<usize> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let removed = conn.execute(
            "DELETE FROM ledger WHERE processed_at < ?1",
            params![cutoff_ms as i64],
        )?;
        Ok(removed)
    }

    // ── Outbox ───────────────────────────────────────────────────

    /// Enqueues a message for a peer. Duplicate (peer, message) pairs are
    /// ignored so relays cannot double-enqueue.
    pub fn enqueue(
        &self,
        peer: &DeviceId,
        message_id: &MessageId,
        message: &str,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT OR IGNORE INTO outbox (peer_id, message_id, message) VALUES (?1, ?2, ?3)",
            params![peer.to_string(), message_id.to_string(), message],
        )?;
        Ok(())
    }

    /// Returns the pending (unacknowledged) entries for a peer in enqueue
    /// order.
    pub fn pending_for_peer(&self, peer: &DeviceId) -> StoreResult<Vec<OutboxEntry>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, message_id, message, attempts, last_attempt
             FROM outbox WHERE peer_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![peer.to_string()], |row| {
            let id: i64 = row.get(0)?;
            let message_id: String = row.get(1)?;
            let message: String = row.get(2)?;
            let attempts: i64 = row.get(3)?;
            let last_attempt: Option<i64> = row.get(4)?;
            Ok((id, message_id, message, attempts, last_attempt))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, message_id, message, attempts, last_attempt) = row?;
            let message_id = message_id
                .parse()
                .map_err(|e| StoreError::Corrupt(format!("outbox message_id: {e}")))?;
            entries.push(OutboxEntry {
                id,
                peer: *peer,
                message_id,
                message,
                attempts: attempts as u32,
                last_attempt_ms: last_attempt.map(|v| v as u64),
            });
        }
        Ok(entries)
    }

    /// Records a send attempt for an outbox entry.
    pub fn record_attempt(&self, entry_id: i64, now_ms: u64) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE outbox SET attempts = attempts + 1, last_attempt = ?2 WHERE id = ?1",
            params![entry_id, now_ms as i64],
        )?;
        Ok(())
    }

    /// Resets the attempt counters for a peer's entries.
    ///
    /// Called when a connection to the peer is (re)established so every
    /// entry gets a fresh retry budget; exhausting the budget only ever
    /// parks an entry until the next reconnect.
    pub fn reset_attempts(&self, peer: &DeviceId) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE outbox SET attempts = 0, last_attempt = NULL WHERE peer_id = ?1",
            params![peer.to_string()],
        )?;
        Ok(())
    }

    /// Removes an outbox entry on acknowledgment. Returns true if a
    /// pending entry was matched. Acknowledgment is the only way an entry
    /// leaves the outbox short of permanent peer removal.
    pub fn mark_acked(&self, peer: &DeviceId, message_id: &MessageId) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let changed = conn.execute(
            "DELETE FROM outbox WHERE peer_id = ?1 AND message_id = ?2",
            params![peer.to_string(), message_id.to_string()],
        )?;
        Ok(changed > 0)
    }

    /// Count of pending entries across all peers.
    pub fn pending_count(&self) -> StoreResult<u64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Count of pending entries for one peer.
    pub fn pending_count_for_peer(&self, peer: &DeviceId) -> StoreResult<u64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM outbox WHERE peer_id = ?1",
            params![peer.to_string()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Removes every outbox entry for a peer. Only used when a peer is
    /// permanently removed from the venue — never for send failures.
    pub fn remove_peer(&self, peer: &DeviceId) -> StoreResult<usize> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let removed = conn.execute(
            "DELETE FROM outbox WHERE peer_id = ?1",
            params![peer.to_string()],
        )?;
        Ok(removed)
    }

    // ── Record registry ──────────────────────────────────────────

    /// Returns the version tag of the last applied change for a record.
    pub fn record_tag(&self, record: &RecordKey) -> StoreResult<Option<VersionTag>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tag = conn
            .query_row(
                "SELECT priority, version, counter, checksum
                 FROM records WHERE record_kind = ?1 AND record_id = ?2",
                params![record.kind.to_string(), record.id],
                |row| {
                    let priority: i64 = row.get(0)?;
                    let version: i64 = row.get(1)?;
                    let counter: i64 = row.get(2)?;
                    let checksum: String = row.get(3)?;
                    Ok(VersionTag::new(
                        priority,
                        version as u64,
                        counter as u64,
                        checksum,
                    ))
                },
            )
            .optional()?;
        Ok(tag)
    }

    /// Upserts the version tag for a record outside of a message commit
    /// (local publishes).
    pub fn put_record_tag(&self, record: &RecordKey, tag: &VersionTag) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO records (record_kind, record_id, priority, version, counter, checksum)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(record_kind, record_id) DO UPDATE SET
                 priority = excluded.priority,
                 version = excluded.version,
                 counter = excluded.counter,
                 checksum = excluded.checksum",
            params![
                record.kind.to_string(),
                record.id,
                tag.priority,
                tag.version as i64,
                tag.counter as i64,
                tag.checksum,
            ],
        )?;
        Ok(())
    }

    /// Returns the highest version recorded for a record, or 0.
    pub fn current_version(&self, record: &RecordKey) -> StoreResult<u64> {
        Ok(self.record_tag(record)?.map(|t| t.version).unwrap_or(0))
    }

    /// Lists the distinct record kinds present in the registry.
    pub fn record_kinds(&self) -> StoreResult<Vec<RecordKind>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare("SELECT DISTINCT record_kind FROM records")?;
        let rows = stmt.query_map([], |row| {
            let kind: String = row.get(0)?;
            Ok(kind)
        })?;

        let mut kinds = Vec::new();
        for row in rows {
            let raw = row?;
            let kind = match raw.as_str() {
                "order" => RecordKind::Order,
                "order_detail" => RecordKind::OrderDetail,
                "table" => RecordKind::Table,
                "menu" => RecordKind::Menu,
                other => {
                    return Err(StoreError::Corrupt(format!("unknown record kind: {other}")))
                }
            };
            kinds.push(kind);
        }
        Ok(kinds)
    }
}
