//! Store trait: the abstract interface for gateway envelope persistence.
//!
//! Implementations include SQLite (primary) and in-memory (for tests).

use async_trait::async_trait;
use bytes::Bytes;

use meshlog_core::{Address, NodeId, PayerId, PicoDollar, SequenceId, VectorClock};

use crate::error::Result;

/// The durable, persisted representation of a received envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayEnvelope {
    pub originator_node_id: NodeId,
    pub originator_sequence_id: SequenceId,
    /// Wire bytes of the target topic.
    pub topic: Vec<u8>,
    pub payer_id: Option<PayerId>,
    /// Originator receive time, unix nanoseconds.
    pub gateway_time_ns: i64,
    /// Unix seconds after which the envelope may be pruned, 0 for never.
    pub expiry_unixtime: u64,
    /// Encoded originator envelope.
    pub originator_envelope: Bytes,
}

/// Usage to attribute to a payer when an envelope is first persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageIncrement {
    pub payer_id: PayerId,
    pub originator_id: NodeId,
    pub minutes_since_epoch: i64,
    pub spend: PicoDollar,
    pub sequence_id: SequenceId,
}

/// Accumulated, not-yet-billed usage for one payer/originator/minute bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsettledUsage {
    pub payer_id: PayerId,
    pub originator_id: NodeId,
    pub minutes_since_epoch: i64,
    pub spend: PicoDollar,
    pub last_sequence_id: SequenceId,
    pub message_count: u64,
}

/// Highest persisted sequence id for one originator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorClockEntry {
    pub originator_node_id: NodeId,
    pub originator_sequence_id: SequenceId,
    pub gateway_time_ns: i64,
}

/// Async interface for gateway envelope persistence.
///
/// Envelopes are keyed by `(originator_node_id, originator_sequence_id)`.
/// Inserting an existing key is a no-op that reports zero affected rows;
/// rows are never updated once written.
#[async_trait]
pub trait Store: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Envelopes
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert an envelope and, only if it was new, add its cost to the
    /// payer's unsettled usage and bump the originator's congestion counter.
    ///
    /// Runs in a single transaction. Returns the number of envelope rows
    /// inserted (0 or 1).
    async fn insert_gateway_envelope_and_increment_unsettled_usage(
        &self,
        envelope: GatewayEnvelope,
        usage: UsageIncrement,
    ) -> Result<u64>;

    /// Insert an envelope with no usage accounting. Returns rows inserted.
    async fn insert_gateway_envelope(&self, envelope: GatewayEnvelope) -> Result<u64>;

    /// All persisted envelopes of one originator in sequence order.
    async fn gateway_envelopes_by_originator(
        &self,
        originator: NodeId,
    ) -> Result<Vec<GatewayEnvelope>>;

    /// Highest persisted sequence id of every originator.
    async fn select_vector_clock(&self) -> Result<Vec<VectorClockEntry>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Payers and usage
    // ─────────────────────────────────────────────────────────────────────────

    /// Return the id of the payer with this address, creating it if needed.
    async fn find_or_create_payer(&self, address: &Address) -> Result<PayerId>;

    async fn unsettled_usage(
        &self,
        payer_id: PayerId,
        originator: NodeId,
        minutes_since_epoch: i64,
    ) -> Result<Option<UnsettledUsage>>;

    /// Messages persisted for `originator` during the given minute.
    async fn originator_congestion(
        &self,
        originator: NodeId,
        minutes_since_epoch: i64,
    ) -> Result<u64>;
}

/// Convenience methods layered on [`Store`].
#[async_trait]
pub trait StoreExt: Store {
    /// The vector clock a node would send to resume streaming.
    async fn vector_clock(&self) -> Result<VectorClock> {
        Ok(self
            .select_vector_clock()
            .await?
            .into_iter()
            .map(|e| (e.originator_node_id, e.originator_sequence_id))
            .collect())
    }
}

impl<S: Store + ?Sized> StoreExt for S {}
