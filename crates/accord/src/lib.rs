//! # Accord
//!
//! The unified API for the Accord sync engine - multi-member data
//! synchronization with change detection, identity mapping, filtering,
//! and crash-safe propagation.
//!
//! ## Overview
//!
//! Accord keeps N member data stores (address books, calendars, note and
//! task collections) convergent without trusting any member to know what
//! changed:
//!
//! - **Change detection**: per-member fingerprint tables re-derive what
//!   was added, modified, or deleted from plain full reports
//! - **Identity mapping**: records describing the same entity on different
//!   members are grouped under one mapping, whatever ids the members use
//! - **Filtering**: an ordered first-match-wins rule chain decides which
//!   member pairs a change may propagate across
//! - **Crash safety**: payloads are archived and markers written before a
//!   destination is contacted, so an interrupted pass is replayed, never
//!   repeated or lost
//!
//! ## Key Concepts
//!
//! - **Member**: one synchronized data store, driven through the
//!   [`Member`] trait.
//! - **Pass**: one session over all members: fetch, classify, reconcile,
//!   commit, finalize.
//! - **Slow sync**: a member whose anchor token changed is treated as
//!   brand new; grouping prevents duplicates.
//! - **Conflict**: an entity changed on more than one member in the same
//!   pass. Reported, never silently resolved.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use accord::{Category, Group, GroupConfig};
//! use accord::engine::memory::InMemoryMember;
//! use accord::store::SqliteStore;
//!
//! async fn example() {
//!     // Open storage
//!     let store = SqliteStore::open("accord.db").unwrap();
//!
//!     // Create the group and register members
//!     let mut group = Group::new(store, GroupConfig::default());
//!     let phone = group.add_member(Arc::new(InMemoryMember::new(
//!         "phone",
//!         [Category::new("contacts")],
//!     )));
//!     let laptop = group.add_member(Arc::new(InMemoryMember::new(
//!         "laptop",
//!         [Category::new("contacts")],
//!     )));
//!
//!     // One pass: whatever changed on either member reaches the other
//!     let report = group.synchronize().await.unwrap();
//!     println!("{report}");
//! }
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports the component crates for convenience:
//!
//! - `accord::core` - Core primitives (ids, change records, mappings)
//! - `accord::store` - Storage abstraction, SQLite and in-memory
//! - `accord::filter` - The propagation rule chain
//! - `accord::engine` - The session coordinator and member contract

pub mod error;
pub mod group;

// Re-export component crates
pub use accord_core as core;
pub use accord_engine as engine;
pub use accord_filter as filter;
pub use accord_store as store;

// Re-export main types for convenience
pub use error::{GroupError, Result};
pub use group::{Group, GroupConfig};

// Re-export commonly used component types
pub use accord_core::{
    AnchorToken, ArchiveId, Category, ChangeKind, ChangeRecord, Fingerprint, FormatTag, Mapping,
    MappingEntry, MappingId, MappingTable, MemberId, UniqueId,
};
pub use accord_engine::{
    AbortHandle, Conflict, ConflictAction, ConflictPolicy, Coordinator, Correlator, EngineError,
    Member, MemberError, MemberInfo, MemberOutcome, MemberReport, ReportOnly, SessionConfig,
    SessionReport, SessionStage, UidCorrelator,
};
pub use accord_filter::{FilterAction, FilterChain, FilterRule, RuleId, Verdict};
pub use accord_store::{MemoryStore, SqliteStore, Store};
