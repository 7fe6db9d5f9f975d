//! # Accord Core
//!
//! Pure primitives for the Accord reconciliation engine: change records,
//! fingerprint tables, and cross-member identity mappings.
//!
//! This crate contains no I/O, no storage, no networking. It is pure
//! computation over synchronization state.
//!
//! ## Key Types
//!
//! - [`ChangeRecord`] - One reported change for one unique id on one member
//! - [`HashTable`] - Fingerprint store that classifies changes and infers deletions
//! - [`MappingTable`] - Groups per-member records that are the same logical entity
//! - [`MemberId`], [`Category`], [`UniqueId`] - The coordinate system of a sync
//!
//! ## Classification
//!
//! Members are never trusted to track what changed. Every reported record is
//! re-classified against the last known fingerprint. See [`hashtable`].

pub mod change;
pub mod error;
pub mod hashtable;
pub mod mapping;
pub mod types;

pub use change::{ChangeKind, ChangeRecord, FormatTag};
pub use error::{CoreError, Result};
pub use hashtable::HashTable;
pub use mapping::{Mapping, MappingEntry, MappingTable};
pub use types::{AnchorToken, ArchiveId, Category, Fingerprint, MappingId, MemberId, UniqueId};
