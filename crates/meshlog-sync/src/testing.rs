//! In-memory collaborators for tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use meshlog_core::{DomainSeparator, NodeId, OriginatorEnvelope, PayerId, PicoDollar, SequenceId};
use meshlog_store::Store;

use crate::error::{Result, SyncError};
use crate::fees::FeeCalculator;
use crate::payer_report::PayerReportStore;

/// Charges the same fees for every envelope.
#[derive(Debug, Default)]
pub struct FixedFeeCalculator {
    base_fee: PicoDollar,
    congestion_fee: PicoDollar,
    base_calls: AtomicUsize,
    congestion_calls: AtomicUsize,
    failures: AtomicUsize,
}

impl FixedFeeCalculator {
    pub fn new(base_fee: PicoDollar, congestion_fee: PicoDollar) -> Self {
        Self {
            base_fee,
            congestion_fee,
            ..Self::default()
        }
    }

    /// Fail the next `n` base fee calculations.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn base_calls(&self) -> usize {
        self.base_calls.load(Ordering::SeqCst)
    }

    pub fn congestion_calls(&self) -> usize {
        self.congestion_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeeCalculator for FixedFeeCalculator {
    fn calculate_base_fee(
        &self,
        _at_ns: i64,
        _payload_len: u64,
        _retention_days: u32,
    ) -> Result<PicoDollar> {
        self.base_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SyncError::Fee("rates unavailable".into()));
        }
        Ok(self.base_fee)
    }

    async fn calculate_congestion_fee(
        &self,
        _store: &dyn Store,
        _at_ns: i64,
        _originator: NodeId,
    ) -> Result<PicoDollar> {
        self.congestion_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.congestion_fee)
    }
}

/// A synced report or attestation as the store received it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncedRecord {
    pub originator: NodeId,
    pub sequence_id: SequenceId,
    pub payer_id: PayerId,
    /// Set for reports only.
    pub domain_separator: Option<DomainSeparator>,
}

/// Records everything it is asked to store.
#[derive(Debug, Default)]
pub struct RecordingPayerReportStore {
    reports: Mutex<Vec<SyncedRecord>>,
    attestations: Mutex<Vec<SyncedRecord>>,
    fail: AtomicBool,
}

impl RecordingPayerReportStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every store call fail.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn reports(&self) -> Vec<SyncedRecord> {
        self.reports.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn attestations(&self) -> Vec<SyncedRecord> {
        self.attestations.lock().map(|a| a.clone()).unwrap_or_default()
    }

    fn record(
        &self,
        into: &Mutex<Vec<SyncedRecord>>,
        envelope: &OriginatorEnvelope,
        payer_id: PayerId,
        domain_separator: Option<DomainSeparator>,
    ) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SyncError::PayerReport("report rejected".into()));
        }
        into.lock()
            .map_err(|e| SyncError::PayerReport(e.to_string()))?
            .push(SyncedRecord {
                originator: envelope.originator_node_id(),
                sequence_id: envelope.sequence_id(),
                payer_id,
                domain_separator,
            });
        Ok(())
    }
}

#[async_trait]
impl PayerReportStore for RecordingPayerReportStore {
    async fn store_synced_report(
        &self,
        envelope: &OriginatorEnvelope,
        payer_id: PayerId,
        domain_separator: DomainSeparator,
    ) -> Result<()> {
        self.record(&self.reports, envelope, payer_id, Some(domain_separator))
    }

    async fn store_synced_attestation(
        &self,
        envelope: &OriginatorEnvelope,
        payer_id: PayerId,
    ) -> Result<()> {
        self.record(&self.attestations, envelope, payer_id, None)
    }
}
