//! Core type definitions for the Comanda sync engine.
//!
//! Shared by the store and sync crates:
//! - Identifier newtypes (`DeviceId`, `MessageId`)
//! - Record addressing (`RecordKind`, `RecordKey`) and the change payload
//!   envelope
//! - The monotonic local clock used for tie-break counters

mod clock;
mod ids;
mod record;
mod version;

pub use clock::{LocalStamp, MonotonicClock};
pub use ids::{DeviceId, MessageId};
pub use record::{ChangePayload, PayloadError, RecordKey, RecordKind};
pub use version::VersionTag;
