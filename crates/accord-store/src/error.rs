//! Error types for the store layer.

use thiserror::Error;

/// Errors that can occur during store operations.
///
/// Any failure leaves the store in its last known-good transactional state;
/// partial writes never become visible.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Payload envelope could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Persisted state violates a model invariant.
    #[error("corrupt state: {0}")]
    Corrupt(String),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// The connection mutex was poisoned by a panicking writer.
    #[error("store mutex poisoned: {0}")]
    Poisoned(String),

    /// The blocking task running the database call was cancelled.
    #[error("blocking task failed: {0}")]
    Task(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
