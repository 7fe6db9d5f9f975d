//! # Accord Engine
//!
//! The session coordinator for the Accord sync engine: connects a group of
//! members, detects what each one changed, reconciles the changes through
//! the filter chain, and propagates them with crash-safe bookkeeping.
//!
//! ## Overview
//!
//! One synchronization pass is driven by a [`Coordinator`]. It walks a
//! fixed sequence of stages: connect, replay interrupted propagations,
//! fetch, classify, reconcile, commit, finalize, disconnect. Members run
//! in parallel where their work is independent (connecting, fetching,
//! committing) and meet at a barrier before reconciliation so implicit
//! deletions can be inferred from complete reports.
//!
//! Per-member failures never abort the pass; they are recorded in the
//! [`SessionReport`] and the member drops out until the next session.
//! Only store faults, identity violations and an explicit abort end a
//! session early.
//!
//! ## Key Types
//!
//! - [`Member`] - The capability contract a backend implements
//! - [`Coordinator`] - Drives one full pass or a read-only preview
//! - [`SessionConfig`] - Timeouts, retry bounds, payload fetching
//! - [`SessionReport`] - What happened, per member and overall
//! - [`Correlator`] - Matches unmapped records to existing identities
//! - [`ConflictPolicy`] - Decides what to do with two-sided changes
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! use accord_core::{Category, MemberId};
//! use accord_engine::{
//!     Coordinator, Member, ReportOnly, SessionConfig, UidCorrelator,
//!     memory::InMemoryMember,
//! };
//! use accord_filter::FilterChain;
//! use accord_store::MemoryStore;
//!
//! async fn example() {
//!     let store = Arc::new(MemoryStore::new());
//!     let mut members: BTreeMap<MemberId, Arc<dyn Member>> = BTreeMap::new();
//!     members.insert(
//!         MemberId::new(1),
//!         Arc::new(InMemoryMember::new("phone", [Category::new("contacts")])),
//!     );
//!     members.insert(
//!         MemberId::new(2),
//!         Arc::new(InMemoryMember::new("laptop", [Category::new("contacts")])),
//!     );
//!
//!     let chain = FilterChain::new();
//!     let coordinator = Coordinator::new(
//!         store,
//!         &members,
//!         &chain,
//!         &UidCorrelator,
//!         &ReportOnly,
//!         SessionConfig::default(),
//!     );
//!     let report = coordinator.run().await.unwrap();
//!     println!("{report}");
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Single writer**: classification and the mapping table live on the
//!   coordinator task; worker tasks only talk to members and the store
//! - **Marker before member**: every commit archives its payload and writes
//!   an in-flight marker before the member is contacted, so a crash at any
//!   point is replayable
//! - **Previews are inert**: a preview session fetches metadata only and
//!   performs no durable write of any kind

pub mod conflict;
pub mod correlate;
pub mod error;
pub mod member;
pub mod plan;
pub mod report;
pub mod session;

pub use conflict::{Conflict, ConflictAction, ConflictPolicy, ReportOnly};
pub use correlate::{Correlator, NullCorrelator, UidCorrelator};
pub use error::{EngineError, Result};
pub use member::memory;
pub use member::{CommitRequest, Member, MemberError, MemberInfo, MemberResult};
pub use plan::{build_plan, Plan, PlannedCommit};
pub use report::{FailedCommit, MemberOutcome, MemberReport, SessionReport, SessionStage};
pub use session::{AbortHandle, Coordinator, SessionConfig};
