//! Error types for the sync layer.

use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
///
/// Peer churn, transport drops and corrupt frames are all recoverable:
/// the engine logs them, preserves the outbox and keeps running. Only
/// `Storage` is treated as fatal by the host.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Network error.
    #[error("network error: {0}")]
    Network(String),

    /// Protocol error (invalid or unexpected message).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Payload checksum did not match its declared value.
    #[error("checksum mismatch on message {message_id}")]
    ChecksumMismatch {
        /// The offending message.
        message_id: String,
    },

    /// Durable store failure, the one fatal condition.
    #[error("storage error: {0}")]
    Storage(#[from] comanda_store::StoreError),

    /// The persistence bridge refused or failed to apply a change.
    #[error("apply failed: {0}")]
    Apply(String),

    /// Local service discovery failure.
    #[error("discovery error: {0}")]
    Discovery(String),

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Channel closed.
    #[error("channel closed")]
    ChannelClosed,

    /// Lifecycle call made in a state that does not permit it.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidState {
        /// Current state.
        from: String,
        /// Requested operation or target state.
        to: String,
    },
}
