//! Durable sync state for Comanda.
//!
//! Everything the engine must not lose across a crash lives here, in one
//! SQLite file:
//!
//! - **Ledger** — processed message identifiers; presence means a message
//!   was applied and may be re-acknowledged without reapplying.
//! - **Outbox** — per-peer queue of messages awaiting acknowledgment.
//! - **Record registry** — the version tag of each record's last applied
//!   change, consulted by conflict resolution.
//!
//! The store is deliberately protocol-agnostic: messages are kept as their
//! serialized wire form and decoded by the sync layer.

mod error;
mod store;

pub use error::{StoreError, StoreResult};
pub use store::{OutboxEntry, SyncStore};
