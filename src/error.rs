//! Error types for kvsql
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using KvError
pub type Result<T> = std::result::Result<T, KvError>;

/// Unified error type for kvsql operations
#[derive(Debug, Error)]
pub enum KvError {
    // -------------------------------------------------------------------------
    // Storage Errors
    // -------------------------------------------------------------------------
    #[error("{0}")]
    Storage(#[from] rusqlite::Error),

    #[error("{0}")]
    Postgres(#[from] postgres::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend is closed")]
    Closed,

    // -------------------------------------------------------------------------
    // Revision Errors
    // -------------------------------------------------------------------------
    #[error("required revision {revision} has been compacted (compact revision {compact_revision})")]
    Compacted {
        revision: i64,
        compact_revision: i64,
    },

    #[error("required revision {requested} is a future revision (current revision {current})")]
    FutureRevision { requested: i64, current: i64 },

    #[error("revision mismatch on {key}: expected {expected}, found {actual}")]
    Conflict {
        key: String,
        expected: i64,
        actual: i64,
    },

    // -------------------------------------------------------------------------
    // Caller Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("{0} is not implemented")]
    Unimplemented(&'static str),

    // -------------------------------------------------------------------------
    // Context Errors
    // -------------------------------------------------------------------------
    #[error("context canceled")]
    Canceled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

impl KvError {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        KvError::Validation(msg.into())
    }

    /// Whether this error reports a permanent capability gap.
    pub fn is_unimplemented(&self) -> bool {
        matches!(self, KvError::Unimplemented(_))
    }
}
