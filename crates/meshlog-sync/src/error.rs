//! Error types for the sync module.

use thiserror::Error;

use meshlog_core::NodeId;

use crate::transport::StreamError;

/// Errors that can occur during replication.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Could not reach or talk to a peer.
    #[error("transport error: {0}")]
    Transport(String),

    /// The subscription stream ended with an error.
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] meshlog_store::StoreError),

    /// Envelope failed to decode, parse or verify.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(#[from] meshlog_core::CoreError),

    /// A peer sent an envelope for an originator it may not speak for.
    #[error("originator {originator} is not permitted on the stream from node {peer}")]
    OriginatorNotPermitted { originator: NodeId, peer: NodeId },

    /// Registry lookup failed.
    #[error("registry error: {0}")]
    Registry(String),

    /// Node is not in the registry.
    #[error("node {0} not found in registry")]
    NodeNotFound(NodeId),

    /// Fee calculator failed.
    #[error("fee calculation failed: {0}")]
    Fee(String),

    /// Payer report store rejected a synced record.
    #[error("payer report store error: {0}")]
    PayerReport(String),

    /// Auth token could not be issued or verified.
    #[error("auth error: {0}")]
    Auth(String),

    /// The envelope sink is gone.
    #[error("write queue closed")]
    QueueClosed,
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
