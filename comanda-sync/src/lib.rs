//! Peer-to-peer venue sync engine for Comanda.
//!
//! Keeps every tablet at a venue converged on shared operational state
//! (orders, line items, table status, kitchen claims, menu changes) with
//! no server and no internet. Devices discover each other on the local
//! network, exchange change messages directly, and resolve concurrent
//! updates deterministically so any delivery order converges.
//!
//! # Components
//!
//! - **Discovery**: mDNS advertisement/browsing and the transport-level
//!   group-owner election
//! - **Transport**: one TCP channel per peer; direct dial first, then
//!   the service-discovery fallback
//! - **Protocol / codec**: the message envelope, its checksum rules and
//!   length-prefixed JSON framing
//! - **Resolver**: last-writer-wins over (priority, version, counter,
//!   checksum)
//! - **Engine**: the lifecycle state machine, one supervised task per
//!   peer, outbox retransmission with backoff, heartbeats
//! - **Bridge**: the seam through which winning changes reach
//!   business-entity storage
//!
//! Durable state (outbox, ledger, record tags) lives in
//! [`comanda_store::SyncStore`]; the engine survives being killed at any
//! instant.
//!
//! # Example
//!
//! ```no_run
//! use comanda_sync::{SyncConfig, SyncEngine};
//! use comanda_sync::bridge::MemoryBridge;
//! use comanda_sync::discovery::StaticDiscovery;
//! use comanda_sync::transport::mock::MockTransport;
//! use comanda_store::SyncStore;
//! use comanda_types::DeviceId;
//! use std::sync::Arc;
//!
//! # async fn run() -> comanda_sync::SyncResult<()> {
//! let device = DeviceId::new();
//! let store = Arc::new(SyncStore::open_in_memory()?);
//! let engine = SyncEngine::new(
//!     SyncConfig::default(),
//!     store,
//!     Arc::new(MemoryBridge::new()),
//!     Arc::new(StaticDiscovery::new(device, vec![])),
//!     Arc::new(MockTransport::new(device)),
//! );
//! engine.initialize().await?;
//! engine.start_sync().await?;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod codec;
mod config;
pub mod discovery;
mod engine;
mod error;
pub mod peer;
pub mod protocol;
pub mod resolver;
pub mod transport;

pub use config::{PriorityMap, RetryPolicy, SyncConfig};
pub use engine::{EngineState, SyncEngine, SyncStatus};
pub use error::{SyncError, SyncResult};
pub use peer::{ConnectionType, PeerDevice};
pub use protocol::{MessageKind, SyncMessage, PROTOCOL_VERSION};
