//! Error types for graft

use thiserror::Error;

/// Result type alias for graft operations
pub type GraftResult<T> = Result<T, GraftError>;

/// Error types for graph construction and execution
#[derive(Debug, Error)]
pub enum GraftError {
    /// The input object graph is structurally invalid: a non-object value
    /// where a row was expected, an unresolvable `#id`/`#ref` reference, or
    /// a reference cycle. Raised during construction, before any I/O.
    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    /// A traversed relation path falls outside the supplied allow-list.
    #[error("Unallowed relation: {0}")]
    UnallowedRelation(String),

    /// A `#dbRef` relate target was reached through a to-many relation.
    /// The insert-only engine cannot express this (it would require an
    /// UPDATE on the existing row).
    #[error("Relate error: {0}")]
    Relate(String),

    /// Input validation error outside graph structure (unknown table,
    /// malformed option, row not reconcilable against the persisted graph).
    #[error("Validation error: {0}")]
    Validation(String),

    /// The injected executor failed or returned an inconsistent result.
    #[error("Executor error: {0}")]
    Executor(String),
}

impl GraftError {
    /// Create an invalid-graph error
    pub fn invalid_graph(message: impl Into<String>) -> Self {
        Self::InvalidGraph(message.into())
    }

    /// Create an unallowed-relation error
    pub fn unallowed_relation(path: impl Into<String>) -> Self {
        Self::UnallowedRelation(path.into())
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create an executor error
    pub fn executor(message: impl Into<String>) -> Self {
        Self::Executor(message.into())
    }

    /// Check if this is an invalid-graph error
    pub fn is_invalid_graph(&self) -> bool {
        matches!(self, Self::InvalidGraph(_))
    }

    /// Check if this is an unallowed-relation error
    pub fn is_unallowed_relation(&self) -> bool {
        matches!(self, Self::UnallowedRelation(_))
    }
}
