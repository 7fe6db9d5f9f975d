//! Error types for the engine module.
//!
//! Per-member failures are not here; they are [`MemberError`] values
//! recorded in the session report, because one member failing must not
//! abort the others. `EngineError` is for faults that invalidate the
//! whole session.
//!
//! [`MemberError`]: crate::member::MemberError

use thiserror::Error;

/// Session-fatal errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Identity bookkeeping rejected a grouping operation.
    #[error("identity error: {0}")]
    Identity(#[from] accord_core::CoreError),

    /// The durable store failed.
    #[error("store error: {0}")]
    Store(#[from] accord_store::StoreError),

    /// Filter configuration was rejected.
    #[error("filter error: {0}")]
    Filter(#[from] accord_filter::FilterError),

    /// The session was aborted through its abort handle.
    #[error("session aborted")]
    Aborted,
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
