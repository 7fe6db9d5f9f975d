//! # Accord Filter
//!
//! Propagation policy for the Accord sync engine.
//!
//! ## Overview
//!
//! The filter module decides which changes may flow between which members.
//! Policy is an ordered chain of rules; each rule selects propagations by
//! source member, destination member and category, and carries an action.
//! The first matching Allow or Deny decides. Nothing matching means Allow:
//! a group with no rules synchronizes everything.
//!
//! ## Key Concepts
//!
//! - **FilterRule**: Selectors plus an action (Allow, Deny or Ignore)
//! - **FilterChain**: The ordered rule list and the predicate registry
//! - **Predicate**: A named function for per-record decisions that
//!   selectors cannot express (payload size, record contents, ...)
//! - **Verdict**: The chain's final Allow or Deny for one propagation
//!
//! ## Usage
//!
//! ```rust
//! use accord_filter::{FilterChain, FilterRule};
//! use accord_core::MemberId;
//!
//! let mut chain = FilterChain::new();
//!
//! // Never push anything to the read-only member 3.
//! chain
//!     .add_rule(FilterRule::deny().to_member(MemberId::new(3)))
//!     .unwrap();
//!
//! // Per-record policy via a named predicate.
//! chain.register_predicate("small-payloads", |_, _, record| {
//!     record.payload.as_ref().map_or(true, |p| p.len() < 64 * 1024)
//! });
//! chain
//!     .add_rule(FilterRule::allow().with_predicate("small-payloads"))
//!     .unwrap();
//! ```

pub mod chain;
pub mod error;
pub mod rule;

pub use chain::{FilterChain, Predicate};
pub use error::{FilterError, Result};
pub use rule::{FilterAction, FilterRule, RuleId, Verdict};
