//! Error types for the filter module.

use thiserror::Error;

/// Errors that can occur during filter operations.
#[derive(Debug, Error)]
pub enum FilterError {
    /// A rule references a predicate name that was never registered.
    #[error("unknown predicate: {0}")]
    UnknownPredicate(String),
    /// A rule whose selectors can never match any propagation.
    #[error("invalid rule: {0}")]
    InvalidRule(String),
}

/// Result type for filter operations.
pub type Result<T> = std::result::Result<T, FilterError>;
