//! Error types for the Group API.

use accord_core::MemberId;
use accord_engine::EngineError;
use accord_filter::FilterError;
use accord_store::StoreError;
use thiserror::Error;

/// Errors that can occur during Group operations.
#[derive(Debug, Error)]
pub enum GroupError {
    /// A session failed.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// Filter configuration was rejected.
    #[error("filter error: {0}")]
    Filter(#[from] FilterError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// The member id is not part of this group.
    #[error("unknown member: {0}")]
    UnknownMember(MemberId),
}

/// Result type for Group operations.
pub type Result<T> = std::result::Result<T, GroupError>;
