//! Destination for envelopes on reserved payer-report topics.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use meshlog_core::{DomainSeparator, OriginatorEnvelope, PayerId};
use meshlog_store::{GatewayEnvelope, Store};

use crate::error::Result;

/// Persists payer reports and their attestations received from peers.
#[async_trait]
pub trait PayerReportStore: Send + Sync {
    /// A report. `domain_separator` scopes the report signatures.
    async fn store_synced_report(
        &self,
        envelope: &OriginatorEnvelope,
        payer_id: PayerId,
        domain_separator: DomainSeparator,
    ) -> Result<()>;

    async fn store_synced_attestation(
        &self,
        envelope: &OriginatorEnvelope,
        payer_id: PayerId,
    ) -> Result<()>;
}

/// Keeps reports and attestations as plain gateway envelopes, outside usage
/// accounting.
pub struct GatewayPayerReportStore<S> {
    store: Arc<S>,
}

impl<S: Store> GatewayPayerReportStore<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    async fn persist(&self, envelope: &OriginatorEnvelope, payer_id: PayerId) -> Result<u64> {
        let row = GatewayEnvelope {
            originator_node_id: envelope.originator_node_id(),
            originator_sequence_id: envelope.sequence_id(),
            topic: envelope.target_topic().to_bytes(),
            payer_id: Some(payer_id),
            gateway_time_ns: envelope.originator_ns(),
            expiry_unixtime: envelope.unsigned().expiry_unixtime(),
            originator_envelope: Bytes::from(envelope.to_bytes()?),
        };
        Ok(self.store.insert_gateway_envelope(row).await?)
    }
}

#[async_trait]
impl<S: Store> PayerReportStore for GatewayPayerReportStore<S> {
    async fn store_synced_report(
        &self,
        envelope: &OriginatorEnvelope,
        payer_id: PayerId,
        domain_separator: DomainSeparator,
    ) -> Result<()> {
        let inserted = self.persist(envelope, payer_id).await?;
        debug!(
            originator_id = %envelope.originator_node_id(),
            sequence_id = envelope.sequence_id(),
            domain = %domain_separator.to_hex(),
            inserted,
            "stored synced payer report"
        );
        Ok(())
    }

    async fn store_synced_attestation(
        &self,
        envelope: &OriginatorEnvelope,
        payer_id: PayerId,
    ) -> Result<()> {
        let inserted = self.persist(envelope, payer_id).await?;
        debug!(
            originator_id = %envelope.originator_node_id(),
            sequence_id = envelope.sequence_id(),
            inserted,
            "stored synced payer report attestation"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshlog_core::{NodeId, Payload, Topic, TopicKind};
    use meshlog_store::MemoryStore;
    use meshlog_testkit::EnvelopeFactory;

    #[tokio::test]
    async fn test_reports_are_persisted_once() {
        let store = Arc::new(MemoryStore::new());
        let reports = GatewayPayerReportStore::new(store.clone());
        let factory = EnvelopeFactory::new(NodeId(200));
        let envelope = factory.envelope_with_payload(
            1,
            Topic::new(TopicKind::PayerReportsV1, vec![1]),
            Payload::PayerReport(vec![9].into()),
        );

        for _ in 0..2 {
            reports
                .store_synced_report(&envelope, PayerId(1), DomainSeparator::from_bytes([3; 32]))
                .await
                .unwrap();
        }

        let rows = store.gateway_envelopes_by_originator(NodeId(200)).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].payer_id, Some(PayerId(1)));
        let minute = crate::fees::minutes_since_epoch(envelope.originator_ns());
        assert!(store
            .unsettled_usage(PayerId(1), NodeId(200), minute)
            .await
            .unwrap()
            .is_none());
    }
}
