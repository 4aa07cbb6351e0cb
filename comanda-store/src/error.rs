//! Error types for the store layer.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in store operations.
///
/// A store error is the one condition the engine treats as fatal: if the
/// ledger or outbox cannot be read or written, sync cannot run safely.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A stored value failed to parse back.
    #[error("corrupt stored value: {0}")]
    Corrupt(String),
}
