//! # Accord Store
//!
//! Storage abstraction for the Accord sync engine. Provides a trait-based
//! interface for sync-state persistence with SQLite and in-memory
//! implementations.
//!
//! ## Overview
//!
//! The store module abstracts persistence behind the [`Store`] trait,
//! allowing the engine to be storage-agnostic. The primary implementation
//! is [`SqliteStore`], with [`MemoryStore`] for tests and ephemeral groups.
//!
//! Four kinds of state live here, partitioned per member and category:
//! fingerprint tables (change detection), anchors (pass continuity), the
//! change archive (crash-safe propagation payloads), and mapping entries
//! (cross-member identity).
//!
//! ## Key Types
//!
//! - [`Store`] - The async trait for all storage operations
//! - [`SqliteStore`] - SQLite-based persistent storage
//! - [`MemoryStore`] - In-memory storage for tests
//! - [`FinalizeRequest`] - The end-of-pass transactional write
//! - [`ArchivedChange`] - A payload parked in the archive while in flight
//!
//! ## Usage
//!
//! ```rust,no_run
//! use accord_store::{SqliteStore, Store};
//! use accord_core::{Category, MemberId};
//!
//! async fn example() {
//!     // Open a SQLite database
//!     let store = SqliteStore::open("accord.db").unwrap();
//!
//!     // Or use an in-memory database for testing
//!     let store = SqliteStore::open_memory().unwrap();
//!
//!     let hashes = store
//!         .load_hashes(MemberId::new(1), &Category::new("contacts"))
//!         .await
//!         .unwrap();
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Transactional boundaries**: `confirm_commit`, `confirm_delete` and
//!   `finalize_pass` each apply all their effects or none
//! - **Anchors move only at finalize**: a crash before finalize leaves the
//!   old anchor in place, forcing a slow sync next session
//! - **Archive ids are never reused**: a dangling reference can never point
//!   at a different payload than the one that was stored

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{
    ArchivedChange, CommitConfirmation, DeleteConfirmation, FinalizeRequest, Store, StoreExt,
};
