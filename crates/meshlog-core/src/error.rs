//! Error types for meshlog core.

use thiserror::Error;

/// Errors raised while decoding, validating or signing envelopes.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("public key recovery failed")]
    RecoveryFailed,

    #[error("signing failed: {0}")]
    SigningFailed(String),

    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    #[error("payload {payload} does not match topic kind {kind}")]
    PayloadTopicMismatch { payload: &'static str, kind: String },

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
