//! Durable writer for one peer's validated envelopes.
//!
//! The sink drains the write queue one envelope at a time and keeps retrying
//! each until it is stored or the sink is cancelled. Inserts are keyed by
//! `(originator, sequence id)`, so redelivered envelopes are no-ops.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use meshlog_core::{DomainSeparator, OriginatorEnvelope, PayerId, PicoDollar, TopicKind};
use meshlog_store::{ErrorClass, GatewayEnvelope, Store, UsageIncrement};

use crate::backoff::{sleep_or_cancel, ExponentialBackoff};
use crate::config::{BackoffConfig, SyncConfig};
use crate::error::{Result, SyncError};
use crate::fees::{minutes_since_epoch, FeeCalculator};
use crate::payer_report::PayerReportStore;

pub struct EnvelopeSink<S> {
    store: Arc<S>,
    fee_calculator: Arc<dyn FeeCalculator>,
    payer_reports: Arc<dyn PayerReportStore>,
    domain_separator: DomainSeparator,
    write_queue: mpsc::Receiver<OriginatorEnvelope>,
    token: CancellationToken,
    backoff: BackoffConfig,
}

impl<S: Store> EnvelopeSink<S> {
    pub fn new(
        store: Arc<S>,
        fee_calculator: Arc<dyn FeeCalculator>,
        payer_reports: Arc<dyn PayerReportStore>,
        domain_separator: DomainSeparator,
        write_queue: mpsc::Receiver<OriginatorEnvelope>,
        token: CancellationToken,
    ) -> Self {
        Self {
            store,
            fee_calculator,
            payer_reports,
            domain_separator,
            write_queue,
            token,
            backoff: SyncConfig::default().sink_backoff,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Consume the write queue until it closes or the sink is cancelled.
    pub async fn run(mut self) {
        loop {
            let envelope = tokio::select! {
                biased;

                _ = self.token.cancelled() => return,
                next = self.write_queue.recv() => match next {
                    Some(envelope) => envelope,
                    None => {
                        debug!("write queue is closed");
                        return;
                    }
                },
            };

            if !self.store_with_retry(&envelope).await {
                return;
            }
        }
    }

    /// Returns `false` if cancelled before the envelope was stored.
    async fn store_with_retry(&self, envelope: &OriginatorEnvelope) -> bool {
        let mut backoff = ExponentialBackoff::new(self.backoff.clone());
        loop {
            if self.token.is_cancelled() {
                return false;
            }
            let Err(e) = self.store_envelope(envelope).await else {
                return true;
            };

            let originator_id = envelope.originator_node_id();
            let sequence_id = envelope.sequence_id();
            match &e {
                SyncError::Store(store_error) => match store_error.classify() {
                    ErrorClass::Retryable => warn!(
                        %originator_id, sequence_id, error = %e,
                        "retryable storage error, retrying"
                    ),
                    ErrorClass::Unrecognized => error!(
                        %originator_id, sequence_id, error = %e,
                        "unrecognized storage error, may retry indefinitely"
                    ),
                },
                _ => error!(%originator_id, sequence_id, error = %e, "error storing envelope"),
            }

            if !sleep_or_cancel(&self.token, backoff.next_delay()).await {
                return false;
            }
        }
    }

    /// Store one envelope.
    ///
    /// Reserved topics skip fee accounting. For everything else the fee is
    /// recomputed and the local figure is billed, whatever the originator
    /// claimed.
    pub async fn store_envelope(&self, envelope: &OriginatorEnvelope) -> Result<()> {
        let topic = envelope.target_topic();
        if topic.is_reserved() {
            info!(%topic, "found envelope with reserved topic");
            return self.store_reserved_envelope(envelope).await;
        }

        let our_fee = self.calculate_fees(envelope).await?;
        let unsigned = envelope.unsigned();
        let originator_fee = unsigned.base_fee() + unsigned.congestion_fee();
        if our_fee != originator_fee {
            warn!(
                originator_id = %envelope.originator_node_id(),
                sequence_id = envelope.sequence_id(),
                %our_fee,
                %originator_fee,
                "fee calculation mismatch"
            );
        }

        let originator_envelope = Bytes::from(envelope.to_bytes()?);
        let payer_id = self.payer_id(envelope).await?;

        let row = GatewayEnvelope {
            originator_node_id: envelope.originator_node_id(),
            originator_sequence_id: envelope.sequence_id(),
            topic: topic.to_bytes(),
            payer_id: Some(payer_id),
            gateway_time_ns: envelope.originator_ns(),
            expiry_unixtime: unsigned.expiry_unixtime(),
            originator_envelope,
        };
        let usage = UsageIncrement {
            payer_id,
            originator_id: envelope.originator_node_id(),
            minutes_since_epoch: minutes_since_epoch(envelope.originator_ns()),
            spend: our_fee,
            sequence_id: envelope.sequence_id(),
        };

        let inserted = self
            .store
            .insert_gateway_envelope_and_increment_unsettled_usage(row, usage)
            .await?;
        if inserted == 0 {
            debug!(
                originator_id = %envelope.originator_node_id(),
                sequence_id = envelope.sequence_id(),
                "envelope already inserted"
            );
        }
        Ok(())
    }

    /// Hand a reserved-topic envelope to the payer report store.
    ///
    /// Failures from that store are logged and dropped, never retried.
    async fn store_reserved_envelope(&self, envelope: &OriginatorEnvelope) -> Result<()> {
        let payer_id = self.payer_id(envelope).await?;
        let topic = envelope.target_topic();

        match topic.kind() {
            TopicKind::PayerReportsV1 => {
                if let Err(e) = self
                    .payer_reports
                    .store_synced_report(envelope, payer_id, self.domain_separator)
                    .await
                {
                    error!(%topic, error = %e, "failed to store synced report");
                }
            }
            TopicKind::PayerReportAttestationsV1 => {
                if let Err(e) = self
                    .payer_reports
                    .store_synced_attestation(envelope, payer_id)
                    .await
                {
                    error!(%topic, error = %e, "failed to store synced attestation");
                }
            }
            _ => info!(%topic, "received unknown reserved topic"),
        }
        Ok(())
    }

    async fn calculate_fees(&self, envelope: &OriginatorEnvelope) -> Result<PicoDollar> {
        let unsigned = envelope.unsigned();
        let base_fee = self.fee_calculator.calculate_base_fee(
            envelope.originator_ns(),
            unsigned.raw().payer_envelope_bytes.len() as u64,
            envelope.payer_envelope().retention_days(),
        )?;
        let congestion_fee = self
            .fee_calculator
            .calculate_congestion_fee(
                self.store.as_ref(),
                envelope.originator_ns(),
                envelope.originator_node_id(),
            )
            .await?;
        Ok(base_fee + congestion_fee)
    }

    async fn payer_id(&self, envelope: &OriginatorEnvelope) -> Result<PayerId> {
        let address = envelope.payer_envelope().recover_signer()?;
        Ok(self.store.find_or_create_payer(&address).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use meshlog_core::{Address, NodeId, Payload, PayerKeypair, SequenceId, Topic};
    use meshlog_store::{MemoryStore, StoreError, UnsettledUsage, VectorClockEntry};
    use meshlog_testkit::EnvelopeFactory;

    use crate::testing::{FixedFeeCalculator, RecordingPayerReportStore};

    const DOMAIN: DomainSeparator = DomainSeparator::from_bytes([9; 32]);

    struct Harness<S> {
        store: Arc<S>,
        fees: Arc<FixedFeeCalculator>,
        reports: Arc<RecordingPayerReportStore>,
    }

    impl<S: Store> Harness<S> {
        fn new(store: S) -> Self {
            Self {
                store: Arc::new(store),
                fees: Arc::new(FixedFeeCalculator::new(PicoDollar(100), PicoDollar(5))),
                reports: Arc::new(RecordingPayerReportStore::new()),
            }
        }

        fn sink(
            &self,
        ) -> (EnvelopeSink<S>, mpsc::Sender<OriginatorEnvelope>, CancellationToken) {
            let (tx, rx) = mpsc::channel(10);
            let token = CancellationToken::new();
            let sink = EnvelopeSink::new(
                self.store.clone(),
                self.fees.clone(),
                self.reports.clone(),
                DOMAIN,
                rx,
                token.clone(),
            )
            .with_backoff(BackoffConfig {
                initial_interval: Duration::from_millis(1),
                max_interval: Duration::from_millis(5),
                ..BackoffConfig::default()
            });
            (sink, tx, token)
        }
    }

    async fn usage_for(store: &MemoryStore, factory: &EnvelopeFactory, seq: SequenceId) -> Option<UnsettledUsage> {
        let payer = store.find_or_create_payer(&factory.payer().address()).await.unwrap();
        let minute = minutes_since_epoch(factory.envelope(seq).originator_ns());
        store
            .unsettled_usage(payer, factory.originator(), minute)
            .await
            .unwrap()
    }

    async fn wait_for_rows(store: &MemoryStore, expected: usize) {
        for _ in 0..200 {
            if store.envelope_count() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {expected} rows, found {}", store.envelope_count());
    }

    #[tokio::test]
    async fn test_store_envelope_is_idempotent() {
        let h = Harness::new(MemoryStore::new());
        let (sink, _tx, _) = h.sink();
        let factory = EnvelopeFactory::new(NodeId(200)).with_fees(PicoDollar(100), PicoDollar(5));

        let envelope = factory.envelope(1);
        sink.store_envelope(&envelope).await.unwrap();
        sink.store_envelope(&envelope).await.unwrap();

        let rows = h.store.gateway_envelopes_by_originator(NodeId(200)).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].originator_sequence_id, 1);
        assert_eq!(rows[0].gateway_time_ns, envelope.originator_ns());

        let usage = usage_for(&h.store, &factory, 1).await.unwrap();
        assert_eq!(usage.spend, PicoDollar(105));
        assert_eq!(usage.message_count, 1);
    }

    #[tokio::test]
    async fn test_usage_is_billed_to_recovered_payer() {
        let h = Harness::new(MemoryStore::new());
        let (sink, _tx, _) = h.sink();
        let first = EnvelopeFactory::new(NodeId(200));
        let welcome = Topic::new(TopicKind::WelcomeMessagesV1, vec![3; 8]);
        let second = EnvelopeFactory::new(NodeId(200))
            .with_payer(PayerKeypair::from_secret(&[0x42; 32]).unwrap())
            .with_topic(welcome.clone());

        sink.store_envelope(&first.envelope(1)).await.unwrap();
        sink.store_envelope(&second.envelope(2)).await.unwrap();

        assert_eq!(usage_for(&h.store, &first, 1).await.unwrap().message_count, 1);
        let usage = usage_for(&h.store, &second, 2).await.unwrap();
        assert_eq!(usage.message_count, 1);
        assert_eq!(usage.last_sequence_id, 2);

        let rows = h.store.gateway_envelopes_by_originator(NodeId(200)).await.unwrap();
        assert_eq!(rows[1].topic, welcome.to_bytes());
        assert_ne!(rows[0].payer_id, rows[1].payer_id);
    }

    #[tokio::test]
    async fn test_fee_mismatch_bills_local_fee() {
        let h = Harness::new(MemoryStore::new());
        let (sink, _tx, _) = h.sink();
        let factory = EnvelopeFactory::new(NodeId(200)).with_fees(PicoDollar(9_999), PicoDollar(1));

        sink.store_envelope(&factory.envelope(1)).await.unwrap();

        assert_eq!(h.store.envelope_count(), 1);
        let usage = usage_for(&h.store, &factory, 1).await.unwrap();
        assert_eq!(usage.spend, PicoDollar(105));
        assert_eq!(h.fees.base_calls(), 1);
        assert_eq!(h.fees.congestion_calls(), 1);
    }

    #[tokio::test]
    async fn test_reserved_topics_route_by_kind() {
        let h = Harness::new(MemoryStore::new());
        let (sink, _tx, _) = h.sink();
        let factory = EnvelopeFactory::new(NodeId(200));

        let report = factory.envelope_with_payload(
            1,
            Topic::new(TopicKind::PayerReportsV1, vec![1]),
            Payload::PayerReport(vec![1].into()),
        );
        let attestation = factory.envelope_with_payload(
            2,
            Topic::new(TopicKind::PayerReportAttestationsV1, vec![1]),
            Payload::PayerReportAttestation(vec![2].into()),
        );
        sink.store_envelope(&report).await.unwrap();
        sink.store_envelope(&attestation).await.unwrap();

        let reports = h.reports.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].sequence_id, 1);
        assert_eq!(reports[0].domain_separator, Some(DOMAIN));

        let attestations = h.reports.attestations();
        assert_eq!(attestations.len(), 1);
        assert_eq!(attestations[0].sequence_id, 2);
        assert_eq!(attestations[0].domain_separator, None);

        assert_eq!(h.fees.base_calls(), 0);
        assert_eq!(h.fees.congestion_calls(), 0);
        assert_eq!(h.store.envelope_count(), 0);
    }

    #[tokio::test]
    async fn test_reserved_store_failures_are_swallowed() {
        let h = Harness::new(MemoryStore::new());
        let (sink, _tx, _) = h.sink();
        h.reports.set_failing(true);

        let envelope = EnvelopeFactory::new(NodeId(200)).envelope_with_payload(
            1,
            Topic::new(TopicKind::PayerReportsV1, vec![1]),
            Payload::PayerReport(vec![1].into()),
        );
        sink.store_envelope(&envelope).await.unwrap();
        assert!(h.reports.reports().is_empty());
    }

    #[tokio::test]
    async fn test_run_retries_fee_failures() {
        let h = Harness::new(MemoryStore::new());
        let (sink, tx, _) = h.sink();
        h.fees.fail_next(2);
        let handle = tokio::spawn(sink.run());

        tx.send(EnvelopeFactory::new(NodeId(200)).envelope(1)).await.unwrap();
        wait_for_rows(&h.store, 1).await;
        assert_eq!(h.fees.base_calls(), 3);

        drop(tx);
        handle.await.unwrap();
    }

    /// Fails the first inserts with the given error.
    struct FlakyStore {
        inner: MemoryStore,
        failures: AtomicUsize,
        make_error: fn() -> StoreError,
    }

    impl FlakyStore {
        fn new(failures: usize, make_error: fn() -> StoreError) -> Self {
            Self {
                inner: MemoryStore::new(),
                failures: AtomicUsize::new(failures),
                make_error,
            }
        }

        fn fail(&self) -> meshlog_store::Result<()> {
            match self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            {
                Ok(_) => Err((self.make_error)()),
                Err(_) => Ok(()),
            }
        }
    }

    #[async_trait]
    impl Store for FlakyStore {
        async fn insert_gateway_envelope_and_increment_unsettled_usage(
            &self,
            envelope: GatewayEnvelope,
            usage: UsageIncrement,
        ) -> meshlog_store::Result<u64> {
            self.fail()?;
            self.inner
                .insert_gateway_envelope_and_increment_unsettled_usage(envelope, usage)
                .await
        }

        async fn insert_gateway_envelope(
            &self,
            envelope: GatewayEnvelope,
        ) -> meshlog_store::Result<u64> {
            self.inner.insert_gateway_envelope(envelope).await
        }

        async fn gateway_envelopes_by_originator(
            &self,
            originator: NodeId,
        ) -> meshlog_store::Result<Vec<GatewayEnvelope>> {
            self.inner.gateway_envelopes_by_originator(originator).await
        }

        async fn select_vector_clock(&self) -> meshlog_store::Result<Vec<VectorClockEntry>> {
            self.inner.select_vector_clock().await
        }

        async fn find_or_create_payer(&self, address: &Address) -> meshlog_store::Result<PayerId> {
            self.inner.find_or_create_payer(address).await
        }

        async fn unsettled_usage(
            &self,
            payer_id: PayerId,
            originator: NodeId,
            minutes_since_epoch: i64,
        ) -> meshlog_store::Result<Option<UnsettledUsage>> {
            self.inner
                .unsettled_usage(payer_id, originator, minutes_since_epoch)
                .await
        }

        async fn originator_congestion(
            &self,
            originator: NodeId,
            minutes_since_epoch: i64,
        ) -> meshlog_store::Result<u64> {
            self.inner
                .originator_congestion(originator, minutes_since_epoch)
                .await
        }
    }

    #[tokio::test]
    async fn test_run_retries_storage_errors() {
        let make_errors: [fn() -> StoreError; 2] = [
            || StoreError::TaskFailed("connection reset".into()),
            || StoreError::InvalidData("constraint violated".into()),
        ];
        for make_error in make_errors {
            let h = Harness::new(FlakyStore::new(3, make_error));
            let (sink, tx, _) = h.sink();
            let handle = tokio::spawn(sink.run());

            tx.send(EnvelopeFactory::new(NodeId(200)).envelope(1)).await.unwrap();
            wait_for_rows(&h.store.inner, 1).await;

            drop(tx);
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let h = Harness::new(FlakyStore::new(usize::MAX, || {
            StoreError::InvalidData("always".into())
        }));
        let (sink, tx, token) = h.sink();
        let handle = tokio::spawn(sink.run());

        tx.send(EnvelopeFactory::new(NodeId(200)).envelope(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sink stops after cancel")
            .unwrap();
        assert_eq!(h.store.inner.envelope_count(), 0);
    }
}
