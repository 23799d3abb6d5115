//! Originator envelopes: the unit of replication.
//!
//! Envelopes are layered. From the outside in:
//!
//! ```text
//! OriginatorEnvelope           proof (originator signature | blockchain proof)
//!  └ UnsignedOriginatorEnvelope  node id, sequence id, timestamp, fees
//!     └ PayerEnvelope             payer signature, retention
//!        └ ClientEnvelope         topic, depends-on cursor, payload
//! ```
//!
//! Each layer exists twice: a `Raw*` serde struct that mirrors the wire
//! form, and a parsed wrapper that is only constructible from bytes that
//! decode cleanly, name a valid topic, and carry a payload matching that
//! topic's kind. Parsed wrappers are immutable.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::crypto::{payer_signature_digest, Address, RecoverableSignature};
use crate::cursor::Cursor;
use crate::error::{CoreError, Result};
use crate::topic::{Topic, TopicKind};
use crate::types::{NodeId, PicoDollar, SequenceId};

// ─────────────────────────────────────────────────────────────────────────────
// Wire types
// ─────────────────────────────────────────────────────────────────────────────

/// How an originator vouches for an envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Proof {
    /// Recoverable ECDSA signature by the originating node.
    OriginatorSignature { signature: Bytes },
    /// Envelope was sourced from an on-chain transaction.
    BlockchainProof { transaction_hash: Bytes },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawOriginatorEnvelope {
    pub unsigned_originator_envelope: Bytes,
    pub proof: Proof,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawUnsignedOriginatorEnvelope {
    pub originator_node_id: u32,
    pub originator_sequence_id: u64,
    pub originator_ns: i64,
    pub payer_envelope_bytes: Bytes,
    pub base_fee_picodollars: u64,
    pub congestion_fee_picodollars: u64,
    pub expiry_unixtime: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPayerEnvelope {
    pub unsigned_client_envelope: Bytes,
    pub payer_signature: Bytes,
    pub target_originator: u32,
    pub message_retention_days: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedData {
    pub target_topic: Bytes,
    pub depends_on: Option<Cursor>,
    pub is_commit: bool,
}

/// Client payload. The variant must agree with the target topic's kind.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    GroupMessage(Bytes),
    WelcomeMessage(Bytes),
    UploadKeyPackage(Bytes),
    IdentityUpdate(Bytes),
    PayerReport(Bytes),
    PayerReportAttestation(Bytes),
}

impl Payload {
    pub fn name(&self) -> &'static str {
        match self {
            Self::GroupMessage(_) => "group_message",
            Self::WelcomeMessage(_) => "welcome_message",
            Self::UploadKeyPackage(_) => "upload_key_package",
            Self::IdentityUpdate(_) => "identity_update",
            Self::PayerReport(_) => "payer_report",
            Self::PayerReportAttestation(_) => "payer_report_attestation",
        }
    }

    /// The only topic kind this payload may be sent to.
    pub fn topic_kind(&self) -> TopicKind {
        match self {
            Self::GroupMessage(_) => TopicKind::GroupMessagesV1,
            Self::WelcomeMessage(_) => TopicKind::WelcomeMessagesV1,
            Self::UploadKeyPackage(_) => TopicKind::KeyPackagesV1,
            Self::IdentityUpdate(_) => TopicKind::IdentityUpdatesV1,
            Self::PayerReport(_) => TopicKind::PayerReportsV1,
            Self::PayerReportAttestation(_) => TopicKind::PayerReportAttestationsV1,
        }
    }

    pub fn bytes(&self) -> &Bytes {
        match self {
            Self::GroupMessage(b)
            | Self::WelcomeMessage(b)
            | Self::UploadKeyPackage(b)
            | Self::IdentityUpdate(b)
            | Self::PayerReport(b)
            | Self::PayerReportAttestation(b) => b,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawClientEnvelope {
    pub aad: AuthenticatedData,
    pub payload: Payload,
}

// ─────────────────────────────────────────────────────────────────────────────
// Parsed layers
// ─────────────────────────────────────────────────────────────────────────────

/// A client envelope whose topic parsed and whose payload matches it.
#[derive(Clone, Debug)]
pub struct ClientEnvelope {
    raw: RawClientEnvelope,
    topic: Topic,
}

impl ClientEnvelope {
    pub fn from_raw(raw: RawClientEnvelope) -> Result<Self> {
        let topic = Topic::parse(&raw.aad.target_topic)?;
        if raw.payload.topic_kind() != topic.kind() {
            return Err(CoreError::PayloadTopicMismatch {
                payload: raw.payload.name(),
                kind: topic.kind().to_string(),
            });
        }
        Ok(Self { raw, topic })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::from_raw(codec::decode(bytes)?)
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn payload(&self) -> &Payload {
        &self.raw.payload
    }

    pub fn aad(&self) -> &AuthenticatedData {
        &self.raw.aad
    }

    pub fn raw(&self) -> &RawClientEnvelope {
        &self.raw
    }
}

/// A payer envelope with a well-formed client envelope inside.
#[derive(Clone, Debug)]
pub struct PayerEnvelope {
    raw: RawPayerEnvelope,
    client_envelope: ClientEnvelope,
}

impl PayerEnvelope {
    pub fn from_raw(raw: RawPayerEnvelope) -> Result<Self> {
        let client_envelope = ClientEnvelope::from_bytes(&raw.unsigned_client_envelope)?;
        Ok(Self {
            raw,
            client_envelope,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::from_raw(codec::decode(bytes)?)
    }

    pub fn client_envelope(&self) -> &ClientEnvelope {
        &self.client_envelope
    }

    pub fn target_originator(&self) -> NodeId {
        NodeId(self.raw.target_originator)
    }

    pub fn retention_days(&self) -> u32 {
        self.raw.message_retention_days
    }

    pub fn raw(&self) -> &RawPayerEnvelope {
        &self.raw
    }

    /// Recover the payer's address from the signature over the client bytes.
    pub fn recover_signer(&self) -> Result<Address> {
        let signature = RecoverableSignature::from_slice(&self.raw.payer_signature)?;
        signature.recover_address(&payer_signature_digest(&self.raw.unsigned_client_envelope))
    }
}

/// The originator-assigned metadata around a payer envelope.
#[derive(Clone, Debug)]
pub struct UnsignedOriginatorEnvelope {
    raw: RawUnsignedOriginatorEnvelope,
    payer_envelope: PayerEnvelope,
}

impl UnsignedOriginatorEnvelope {
    pub fn from_raw(raw: RawUnsignedOriginatorEnvelope) -> Result<Self> {
        let payer_envelope = PayerEnvelope::from_bytes(&raw.payer_envelope_bytes)?;
        Ok(Self {
            raw,
            payer_envelope,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::from_raw(codec::decode(bytes)?)
    }

    pub fn originator_node_id(&self) -> NodeId {
        NodeId(self.raw.originator_node_id)
    }

    pub fn sequence_id(&self) -> SequenceId {
        self.raw.originator_sequence_id
    }

    pub fn originator_ns(&self) -> i64 {
        self.raw.originator_ns
    }

    pub fn base_fee(&self) -> PicoDollar {
        PicoDollar(self.raw.base_fee_picodollars)
    }

    pub fn congestion_fee(&self) -> PicoDollar {
        PicoDollar(self.raw.congestion_fee_picodollars)
    }

    pub fn expiry_unixtime(&self) -> u64 {
        self.raw.expiry_unixtime
    }

    pub fn payer_envelope(&self) -> &PayerEnvelope {
        &self.payer_envelope
    }

    pub fn raw(&self) -> &RawUnsignedOriginatorEnvelope {
        &self.raw
    }
}

/// A fully parsed originator envelope.
#[derive(Clone, Debug)]
pub struct OriginatorEnvelope {
    raw: RawOriginatorEnvelope,
    unsigned: UnsignedOriginatorEnvelope,
}

impl OriginatorEnvelope {
    pub fn from_raw(raw: RawOriginatorEnvelope) -> Result<Self> {
        let unsigned = UnsignedOriginatorEnvelope::from_bytes(&raw.unsigned_originator_envelope)?;
        Ok(Self { raw, unsigned })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::from_raw(codec::decode(bytes)?)
    }

    pub fn raw(&self) -> &RawOriginatorEnvelope {
        &self.raw
    }

    pub fn unsigned(&self) -> &UnsignedOriginatorEnvelope {
        &self.unsigned
    }

    pub fn proof(&self) -> &Proof {
        &self.raw.proof
    }

    pub fn originator_node_id(&self) -> NodeId {
        self.unsigned.originator_node_id()
    }

    pub fn sequence_id(&self) -> SequenceId {
        self.unsigned.sequence_id()
    }

    pub fn originator_ns(&self) -> i64 {
        self.unsigned.originator_ns()
    }

    pub fn payer_envelope(&self) -> &PayerEnvelope {
        self.unsigned.payer_envelope()
    }

    pub fn target_topic(&self) -> &Topic {
        self.unsigned.payer_envelope().client_envelope().topic()
    }

    /// Bytes that get persisted for this envelope.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        codec::encode(&self.raw)
    }
}
