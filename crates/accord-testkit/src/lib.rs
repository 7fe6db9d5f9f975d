//! # Accord Testkit
//!
//! Testing utilities for Accord.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: ready-made groups of in-memory members for scenario tests
//! - **Scripted members**: members whose next answers are chosen by the test
//! - **Generators**: proptest strategies for property-based testing
//!
//! ## Fixtures
//!
//! Assemble a group and run passes against it:
//!
//! ```no_run
//! use accord_testkit::GroupFixture;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let mut fixture = GroupFixture::new();
//! fixture.add_member("phone", ["contacts".into()]);
//! fixture.add_member("laptop", ["contacts".into()]);
//!
//! fixture.seed(0, "contacts", "alice", b"BEGIN:VCARD").await;
//! let report = fixture.sync().await.unwrap();
//! println!("{report}");
//! # }
//! ```
//!
//! ## Scripted Members
//!
//! Drive the coordinator into timeouts and failures:
//!
//! ```rust
//! use accord_testkit::{Action, ScriptedMember};
//!
//! let member = ScriptedMember::new("flaky", ["contacts".into()]);
//! member.on_connect(Action::Fail("network down".into()));
//! member.on_connect(Action::Stall);
//! ```
//!
//! ## Property Testing
//!
//! Use the generators with proptest:
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use accord_core::HashTable;
//! use accord_testkit::generators::{entries_from_batch, ItemBatch};
//!
//! proptest! {
//!     #[test]
//!     fn seeded_tables_start_quiet(batch: ItemBatch) {
//!         let mut table = HashTable::from_entries(entries_from_batch(&batch));
//!         prop_assert_eq!(table.finalize_pass().len(), batch.items.len());
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;
pub mod scripted;

pub use fixtures::{mesh_fixture, GroupFixture};
pub use generators::{entries_from_batch, ItemBatch};
pub use scripted::{Action, ScriptedMember};
