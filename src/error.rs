//! Crate-level error type.
//!
//! Validation failures and lifecycle conflicts are recoverable and never
//! mutate state. Persistence failures are propagated untouched; the core does
//! not retry on its own except for the bounded optimistic-concurrency loop in
//! the engine, which only reacts to [`LearningError::VersionConflict`].

use thiserror::Error;

/// Main error type for adaptive-learning operations.
#[derive(Error, Debug)]
pub enum LearningError {
    /// A record, pattern, insight or metric failed its structural invariants.
    #[error("validation failed for {subject}: {}", errors.join("; "))]
    Validation { subject: String, errors: Vec<String> },

    /// The operation violates a lifecycle rule (re-apply, rollback before apply, ...).
    #[error("{operation} rejected: {reason}")]
    DomainConflict { operation: String, reason: String },

    /// The stored version moved underneath a read-modify-write cycle.
    #[error("concurrent modification of {key}")]
    VersionConflict { key: String },

    /// Lookup by id or key found nothing.
    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    /// Programmer error, e.g. aggregating an empty slice of summaries.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Gateway-level failure that is not a SQLite or serde error.
    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LearningError {
    pub fn validation(subject: impl Into<String>, errors: Vec<String>) -> Self {
        LearningError::Validation { subject: subject.into(), errors }
    }

    pub fn conflict(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        LearningError::DomainConflict { operation: operation.into(), reason: reason.into() }
    }

    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        LearningError::NotFound { kind: kind.into(), id: id.into() }
    }

    /// `true` for errors the caller may resolve by reloading and retrying.
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, LearningError::VersionConflict { .. })
    }
}

/// Result type alias for adaptive-learning operations.
pub type Result<T> = std::result::Result<T, LearningError>;
