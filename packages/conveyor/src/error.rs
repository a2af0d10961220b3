//! Error types for the queue engine.

use crate::job::JobStatus;

/// Result type used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the public queue, store, and scheduler operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The cron expression could not be parsed as a 5-field expression.
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    /// The serialized payload exceeds the store's size bound.
    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    /// `max_attempts` must be at least 1.
    #[error("max_attempts must be positive, got {0}")]
    InvalidMaxAttempts(i64),

    /// No job row with the given id exists.
    #[error("job {0} not found")]
    NotFound(i64),

    /// The requested admin transition is not legal for the row's current state.
    #[error("cannot {op} job {id} in status {status}")]
    InvalidTransition {
        op: &'static str,
        id: i64,
        status: JobStatus,
    },

    /// The payload envelope could not be serialized.
    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An error from the underlying store.
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl Error {
    /// Whether this error indicates store-level contention that is safe to
    /// retry (SQLite "database is locked"/"busy", pool exhaustion).
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Database(sqlx::Error::PoolTimedOut) => true,
            Error::Database(e) => {
                let msg = e.to_string().to_lowercase();
                msg.contains("database is locked")
                    || msg.contains("database is busy")
                    || msg.contains("database table is locked")
            }
            _ => false,
        }
    }
}
