//! Test fixtures and helpers.
//!
//! Builds fully signed originator envelopes so tests can exercise the
//! validation path end to end.

use bytes::Bytes;

use meshlog_core::{
    codec, AuthenticatedData, NodeId, OriginatorEnvelope, Payload, PayerKeypair, PicoDollar,
    Proof, RawClientEnvelope, RawOriginatorEnvelope, RawPayerEnvelope,
    RawUnsignedOriginatorEnvelope, SequenceId, Topic, TopicKind,
};

/// Timestamp of sequence id 0; each later sequence id is one second on.
pub const BASE_TIMESTAMP_NS: i64 = 1_700_000_000_000_000_000;

const NANOS_PER_SEC: i64 = 1_000_000_000;
const RETENTION_DAYS: u32 = 30;

/// Builds signed envelopes for one originator.
pub struct EnvelopeFactory {
    originator: NodeId,
    payer: PayerKeypair,
    topic: Topic,
    base_fee: PicoDollar,
    congestion_fee: PicoDollar,
}

impl EnvelopeFactory {
    /// Envelopes from `originator`, paid by a payer derived from its id.
    pub fn new(originator: NodeId) -> Self {
        let mut secret = [0x11u8; 32];
        secret[28..].copy_from_slice(&originator.get().to_be_bytes());
        Self {
            originator,
            payer: PayerKeypair::from_secret(&secret).expect("valid secret"),
            topic: Topic::new(TopicKind::GroupMessagesV1, vec![0xAB; 16]),
            base_fee: PicoDollar(100),
            congestion_fee: PicoDollar::ZERO,
        }
    }

    pub fn with_payer(mut self, payer: PayerKeypair) -> Self {
        self.payer = payer;
        self
    }

    /// Fees the originator claims to have charged.
    pub fn with_fees(mut self, base_fee: PicoDollar, congestion_fee: PicoDollar) -> Self {
        self.base_fee = base_fee;
        self.congestion_fee = congestion_fee;
        self
    }

    pub fn with_topic(mut self, topic: Topic) -> Self {
        self.topic = topic;
        self
    }

    pub fn payer(&self) -> &PayerKeypair {
        &self.payer
    }

    pub fn originator(&self) -> NodeId {
        self.originator
    }

    pub fn raw(&self, seq: SequenceId) -> RawOriginatorEnvelope {
        self.raw_at(seq, timestamp_for(seq))
    }

    pub fn raw_at(&self, seq: SequenceId, originator_ns: i64) -> RawOriginatorEnvelope {
        let payload = payload_for(self.topic.kind(), Bytes::from(seq.to_be_bytes().to_vec()));
        self.build(seq, originator_ns, &self.topic.to_bytes(), payload)
    }

    pub fn raw_with_payload(
        &self,
        seq: SequenceId,
        topic: Topic,
        payload: Payload,
    ) -> RawOriginatorEnvelope {
        self.build(seq, timestamp_for(seq), &topic.to_bytes(), payload)
    }

    /// An envelope whose payload does not belong on its topic.
    pub fn raw_with_mismatched_payload(&self, seq: SequenceId) -> RawOriginatorEnvelope {
        let topic = Topic::new(TopicKind::GroupMessagesV1, vec![1]);
        let payload = Payload::WelcomeMessage(Bytes::from_static(b"misaddressed"));
        self.build(seq, timestamp_for(seq), &topic.to_bytes(), payload)
    }

    /// An envelope whose payer signature cannot be recovered.
    pub fn raw_with_bad_payer_signature(&self, seq: SequenceId) -> RawOriginatorEnvelope {
        let mut unsigned: RawUnsignedOriginatorEnvelope =
            codec::decode(&self.raw(seq).unsigned_originator_envelope).expect("decode");
        let mut payer: RawPayerEnvelope =
            codec::decode(&unsigned.payer_envelope_bytes).expect("decode");
        payer.payer_signature = Bytes::from(vec![0u8; 65]);
        unsigned.payer_envelope_bytes = encode(&payer);
        seal(&unsigned)
    }

    pub fn envelope(&self, seq: SequenceId) -> OriginatorEnvelope {
        OriginatorEnvelope::from_raw(self.raw(seq)).expect("valid envelope")
    }

    pub fn envelope_with_payload(
        &self,
        seq: SequenceId,
        topic: Topic,
        payload: Payload,
    ) -> OriginatorEnvelope {
        OriginatorEnvelope::from_raw(self.raw_with_payload(seq, topic, payload))
            .expect("valid envelope")
    }

    fn build(
        &self,
        seq: SequenceId,
        originator_ns: i64,
        topic: &[u8],
        payload: Payload,
    ) -> RawOriginatorEnvelope {
        let client = encode(&RawClientEnvelope {
            aad: AuthenticatedData {
                target_topic: Bytes::copy_from_slice(topic),
                depends_on: None,
                is_commit: false,
            },
            payload,
        });
        let signature = self
            .payer
            .sign_client_envelope(&client)
            .expect("signing succeeds");
        let payer = RawPayerEnvelope {
            unsigned_client_envelope: client,
            payer_signature: Bytes::copy_from_slice(&signature.0),
            target_originator: self.originator.get(),
            message_retention_days: RETENTION_DAYS,
        };
        seal(&RawUnsignedOriginatorEnvelope {
            originator_node_id: self.originator.get(),
            originator_sequence_id: seq,
            originator_ns,
            payer_envelope_bytes: encode(&payer),
            base_fee_picodollars: self.base_fee.get(),
            congestion_fee_picodollars: self.congestion_fee.get(),
            expiry_unixtime: 0,
        })
    }
}

/// Bytes that do not decode as an envelope.
pub fn corrupted_envelope() -> RawOriginatorEnvelope {
    RawOriginatorEnvelope {
        unsigned_originator_envelope: Bytes::from_static(b"\xff\x00not cbor"),
        proof: Proof::OriginatorSignature {
            signature: Bytes::from(vec![0u8; 65]),
        },
    }
}

/// The payload variant that belongs on topics of `kind`.
pub fn payload_for(kind: TopicKind, bytes: Bytes) -> Payload {
    match kind {
        TopicKind::GroupMessagesV1 => Payload::GroupMessage(bytes),
        TopicKind::WelcomeMessagesV1 => Payload::WelcomeMessage(bytes),
        TopicKind::IdentityUpdatesV1 => Payload::IdentityUpdate(bytes),
        TopicKind::KeyPackagesV1 => Payload::UploadKeyPackage(bytes),
        TopicKind::PayerReportsV1 => Payload::PayerReport(bytes),
        TopicKind::PayerReportAttestationsV1 => Payload::PayerReportAttestation(bytes),
    }
}

pub fn timestamp_for(seq: SequenceId) -> i64 {
    BASE_TIMESTAMP_NS + seq as i64 * NANOS_PER_SEC
}

fn seal(unsigned: &RawUnsignedOriginatorEnvelope) -> RawOriginatorEnvelope {
    RawOriginatorEnvelope {
        unsigned_originator_envelope: encode(unsigned),
        proof: Proof::OriginatorSignature {
            signature: Bytes::from(vec![1u8; 65]),
        },
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Bytes {
    Bytes::from(codec::encode(value).expect("encoding succeeds"))
}
