//! Error types for the store module.

use rusqlite::ErrorCode;
use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The blocking worker running a statement panicked or was cancelled.
    #[error("storage task failed: {0}")]
    TaskFailed(String),

    /// Invalid data in storage.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a caller should treat a failed storage operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Lock conflict or lost connection; retrying is expected to succeed.
    Retryable,
    /// Not recognised as transient. Callers that retry anyway may do so forever.
    Unrecognized,
}

impl StoreError {
    /// Classify this error for the replication retry policy.
    ///
    /// SQLite has no deadlock or serialization-failure codes; `BUSY` and
    /// `LOCKED` are its equivalent and are treated as retryable, as are
    /// failures to reach the database file at all.
    pub fn classify(&self) -> ErrorClass {
        match self {
            StoreError::Database(rusqlite::Error::SqliteFailure(err, msg)) => {
                match err.code {
                    ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::CannotOpen => ErrorClass::Retryable,
                    _ => classify_message(msg.as_deref().unwrap_or_default()),
                }
            }
            StoreError::Database(e) => classify_message(&e.to_string()),
            StoreError::TaskFailed(_) | StoreError::Io(_) => ErrorClass::Retryable,
            StoreError::InvalidData(_) | StoreError::Migration(_) => ErrorClass::Unrecognized,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.classify() == ErrorClass::Retryable
    }
}

fn classify_message(msg: &str) -> ErrorClass {
    let msg = msg.to_ascii_lowercase();
    if ["deadlock", "serialization", "connection", "database is locked"]
        .iter()
        .any(|needle| msg.contains(needle))
    {
        ErrorClass::Retryable
    } else {
        ErrorClass::Unrecognized
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
