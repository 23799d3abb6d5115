//! # meshlog core
//!
//! Pure primitives for meshlog: originator envelopes, topics, cursors and
//! payer signatures.
//!
//! This crate contains no I/O, no storage, no networking.
//!
//! ## Key Types
//!
//! - [`OriginatorEnvelope`] - The unit of replication, parsed and immutable
//! - [`Topic`] / [`TopicKind`] - Where an envelope is addressed; some kinds are reserved
//! - [`VectorClock`] - Per-originator high-water marks used to resume streams
//! - [`Address`] - A payer address, always recovered from a signature
//!
//! ## Encoding
//!
//! Every envelope layer is CBOR encoded independently. See [`codec`].

pub mod codec;
pub mod crypto;
pub mod cursor;
pub mod envelope;
pub mod error;
pub mod topic;
pub mod types;

pub use crypto::{
    keccak256, payer_signature_digest, Address, NodeKeypair, NodePublicKey, NodeSignature,
    PayerKeypair, RecoverableSignature,
};
pub use cursor::{Cursor, OriginatorCursor, VectorClock};
pub use envelope::{
    AuthenticatedData, ClientEnvelope, OriginatorEnvelope, Payload, PayerEnvelope, Proof,
    RawClientEnvelope, RawOriginatorEnvelope, RawPayerEnvelope, RawUnsignedOriginatorEnvelope,
    UnsignedOriginatorEnvelope,
};
pub use error::{CoreError, Result};
pub use topic::{Topic, TopicKind};
pub use types::{DomainSeparator, NodeId, PayerId, PicoDollar, SequenceId};
