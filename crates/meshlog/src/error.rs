//! Error types for the server.

use meshlog_sync::SyncError;
use thiserror::Error;

/// Errors that can occur while building or running a [`SyncServer`](crate::SyncServer).
#[derive(Debug, Error)]
pub enum ServerError {
    /// A required builder option was not set.
    #[error("missing required option: {0}")]
    MissingOption(&'static str),

    /// Replication error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),
}

/// Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;
