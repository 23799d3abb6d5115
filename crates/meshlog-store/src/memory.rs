//! In-memory implementation of the Store trait.
//!
//! Primarily for tests. Same semantics as SQLite, nothing persisted.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;

use meshlog_core::{Address, NodeId, PayerId, SequenceId};

use crate::error::{Result, StoreError};
use crate::traits::{GatewayEnvelope, Store, UnsettledUsage, UsageIncrement, VectorClockEntry};

/// In-memory store. Thread-safe via RwLock.
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    envelopes: BTreeMap<(NodeId, SequenceId), GatewayEnvelope>,
    payers: HashMap<Address, PayerId>,
    usage: HashMap<(PayerId, NodeId, i64), UnsettledUsage>,
    congestion: HashMap<(NodeId, i64), u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryStoreInner::default()),
        }
    }

    /// Total number of persisted envelopes.
    pub fn envelope_count(&self) -> usize {
        self.inner.read().map(|i| i.envelopes.len()).unwrap_or(0)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::TaskFailed(format!("lock poisoned: {}", e))
}

impl MemoryStoreInner {
    fn insert(&mut self, envelope: GatewayEnvelope) -> u64 {
        let key = (envelope.originator_node_id, envelope.originator_sequence_id);
        if self.envelopes.contains_key(&key) {
            return 0;
        }
        self.envelopes.insert(key, envelope);
        1
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_gateway_envelope_and_increment_unsettled_usage(
        &self,
        envelope: GatewayEnvelope,
        usage: UsageIncrement,
    ) -> Result<u64> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        if inner.insert(envelope) == 0 {
            return Ok(0);
        }

        let entry = inner
            .usage
            .entry((usage.payer_id, usage.originator_id, usage.minutes_since_epoch))
            .or_insert(UnsettledUsage {
                payer_id: usage.payer_id,
                originator_id: usage.originator_id,
                minutes_since_epoch: usage.minutes_since_epoch,
                spend: Default::default(),
                last_sequence_id: 0,
                message_count: 0,
            });
        entry.spend += usage.spend;
        entry.last_sequence_id = entry.last_sequence_id.max(usage.sequence_id);
        entry.message_count += 1;

        *inner
            .congestion
            .entry((usage.originator_id, usage.minutes_since_epoch))
            .or_insert(0) += 1;

        Ok(1)
    }

    async fn insert_gateway_envelope(&self, envelope: GatewayEnvelope) -> Result<u64> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        Ok(inner.insert(envelope))
    }

    async fn gateway_envelopes_by_originator(
        &self,
        originator: NodeId,
    ) -> Result<Vec<GatewayEnvelope>> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner
            .envelopes
            .range((originator, 0)..=(originator, SequenceId::MAX))
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn select_vector_clock(&self) -> Result<Vec<VectorClockEntry>> {
        let inner = self.inner.read().map_err(poisoned)?;
        let mut latest: BTreeMap<NodeId, VectorClockEntry> = BTreeMap::new();
        // BTreeMap iteration is ordered, so the last write per originator wins.
        for ((node, seq), envelope) in &inner.envelopes {
            latest.insert(
                *node,
                VectorClockEntry {
                    originator_node_id: *node,
                    originator_sequence_id: *seq,
                    gateway_time_ns: envelope.gateway_time_ns,
                },
            );
        }
        Ok(latest.into_values().collect())
    }

    async fn find_or_create_payer(&self, address: &Address) -> Result<PayerId> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        let next = PayerId(inner.payers.len() as i64 + 1);
        Ok(*inner.payers.entry(*address).or_insert(next))
    }

    async fn unsettled_usage(
        &self,
        payer_id: PayerId,
        originator: NodeId,
        minutes_since_epoch: i64,
    ) -> Result<Option<UnsettledUsage>> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner
            .usage
            .get(&(payer_id, originator, minutes_since_epoch))
            .copied())
    }

    async fn originator_congestion(
        &self,
        originator: NodeId,
        minutes_since_epoch: i64,
    ) -> Result<u64> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner
            .congestion
            .get(&(originator, minutes_since_epoch))
            .copied()
            .unwrap_or(0))
    }
}
