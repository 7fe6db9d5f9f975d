//! Error types for Accord core state.

use thiserror::Error;

use crate::types::{MappingId, MemberId, UniqueId};

/// Errors that can occur while maintaining core reconciliation state.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Two reports claim the same (member, unique id) under different
    /// mappings. This threatens the identity model and is session-fatal;
    /// the stale entry must be removed before the record can be re-grouped.
    #[error("identity conflict: {member}/{unique_id} already belongs to mapping {existing}, refused attach to {requested}")]
    IdentityConflict {
        member: MemberId,
        unique_id: UniqueId,
        existing: MappingId,
        requested: MappingId,
    },

    #[error("unknown mapping id: {0}")]
    UnknownMapping(MappingId),

    #[error("change kind {0} is invalid")]
    InvalidKind(u16),
}

pub type Result<T> = std::result::Result<T, CoreError>;
