//! The replication server and its options builder.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use meshlog_core::{DomainSeparator, NodeId, NodeKeypair};
use meshlog_store::Store;
use meshlog_sync::{
    Collaborators, Connector, FeeCalculator, GatewayPayerReportStore, MigrationConfig,
    NodeRegistry, NodeTokenFactory, PayerReportStore, SyncConfig, SyncWorker, TokenFactory,
};

use crate::error::{Result, ServerError};

/// Options for a [`SyncServer`].
///
/// The local node id, store, registry, connector and fee calculator are
/// required, as is either a token factory or the node's signing key. Without
/// a payer report store, synced reports and attestations are written to the
/// gateway envelope table of `store`.
pub struct SyncServerBuilder<S> {
    local_node_id: Option<NodeId>,
    store: Option<Arc<S>>,
    registry: Option<Arc<dyn NodeRegistry>>,
    connector: Option<Arc<dyn Connector>>,
    token_factory: Option<Arc<dyn TokenFactory>>,
    node_keypair: Option<NodeKeypair>,
    fee_calculator: Option<Arc<dyn FeeCalculator>>,
    payer_report_store: Option<Arc<dyn PayerReportStore>>,
    domain_separator: DomainSeparator,
    migration: Option<MigrationConfig>,
    config: SyncConfig,
    cancellation_token: Option<CancellationToken>,
}

impl<S> Default for SyncServerBuilder<S> {
    fn default() -> Self {
        Self {
            local_node_id: None,
            store: None,
            registry: None,
            connector: None,
            token_factory: None,
            node_keypair: None,
            fee_calculator: None,
            payer_report_store: None,
            domain_separator: DomainSeparator::default(),
            migration: None,
            config: SyncConfig::default(),
            cancellation_token: None,
        }
    }
}

impl<S: Store + 'static> SyncServerBuilder<S> {
    pub fn local_node_id(mut self, node_id: NodeId) -> Self {
        self.local_node_id = Some(node_id);
        self
    }

    pub fn store(mut self, store: Arc<S>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn registry(mut self, registry: Arc<dyn NodeRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn token_factory(mut self, token_factory: Arc<dyn TokenFactory>) -> Self {
        self.token_factory = Some(token_factory);
        self
    }

    /// Sign peer auth tokens with `keypair`, valid for
    /// `config.auth_token_ttl`. Ignored when a token factory is set.
    pub fn node_keypair(mut self, keypair: NodeKeypair) -> Self {
        self.node_keypair = Some(keypair);
        self
    }

    pub fn fee_calculator(mut self, fee_calculator: Arc<dyn FeeCalculator>) -> Self {
        self.fee_calculator = Some(fee_calculator);
        self
    }

    pub fn payer_report_store(mut self, payer_report_store: Arc<dyn PayerReportStore>) -> Self {
        self.payer_report_store = Some(payer_report_store);
        self
    }

    pub fn payer_report_domain_separator(mut self, domain_separator: DomainSeparator) -> Self {
        self.domain_separator = domain_separator;
        self
    }

    /// Takes precedence over `config.migration`.
    pub fn migration(mut self, migration: MigrationConfig) -> Self {
        self.migration = Some(migration);
        self
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Cancelling `token` stops the server as [`SyncServer::close`] would,
    /// without waiting for its tasks.
    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = Some(token);
        self
    }

    pub fn build(self) -> Result<SyncServer<S>> {
        let local_node_id = self
            .local_node_id
            .ok_or(ServerError::MissingOption("local node id"))?;
        let store = self.store.ok_or(ServerError::MissingOption("store"))?;
        let registry = self
            .registry
            .ok_or(ServerError::MissingOption("node registry"))?;
        let connector = self
            .connector
            .ok_or(ServerError::MissingOption("connector"))?;
        let fee_calculator = self
            .fee_calculator
            .ok_or(ServerError::MissingOption("fee calculator"))?;
        let payer_reports = self.payer_report_store.unwrap_or_else(|| {
            Arc::new(GatewayPayerReportStore::new(Arc::clone(&store))) as Arc<dyn PayerReportStore>
        });

        let mut config = self.config;
        if let Some(migration) = self.migration {
            config.migration = migration;
        }
        let token_factory: Arc<dyn TokenFactory> = match (self.token_factory, self.node_keypair) {
            (Some(factory), _) => factory,
            (None, Some(keypair)) => Arc::new(NodeTokenFactory::new(
                local_node_id,
                keypair,
                config.auth_token_ttl,
            )),
            (None, None) => return Err(ServerError::MissingOption("token factory")),
        };
        let token = self.cancellation_token.unwrap_or_default();

        let collab = Collaborators {
            local_node_id,
            store,
            registry,
            connector,
            token_factory,
            fee_calculator,
            payer_reports,
            domain_separator: self.domain_separator,
        };

        Ok(SyncServer {
            local_node_id,
            worker: SyncWorker::new(collab, config, &token),
        })
    }
}

/// Replicates envelopes from every peer into the local store.
pub struct SyncServer<S> {
    local_node_id: NodeId,
    worker: SyncWorker<S>,
}

impl<S: Store + 'static> SyncServer<S> {
    pub fn builder() -> SyncServerBuilder<S> {
        SyncServerBuilder::default()
    }

    pub fn local_node_id(&self) -> NodeId {
        self.local_node_id
    }

    /// Subscribe to all current and future peers.
    pub async fn start(&self) -> Result<()> {
        info!(node_id = %self.local_node_id, "starting sync server");
        self.worker.start().await?;
        Ok(())
    }

    /// Stop replication and wait for every task to finish.
    pub async fn close(&self) {
        self.worker.close().await;
        info!(node_id = %self.local_node_id, "sync server stopped");
    }

    /// Peers with an active subscription.
    pub fn subscribed_nodes(&self) -> Vec<NodeId> {
        self.worker.subscribed_nodes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use meshlog_core::{NodeKeypair, PicoDollar};
    use meshlog_store::MemoryStore;
    use meshlog_sync::registry::memory::MemoryRegistry;
    use meshlog_sync::testing::FixedFeeCalculator;
    use meshlog_sync::transport::memory::MemoryNetwork;
    use meshlog_sync::NodeTokenFactory;

    fn complete() -> SyncServerBuilder<MemoryStore> {
        SyncServer::builder()
            .local_node_id(NodeId(100))
            .store(Arc::new(MemoryStore::new()))
            .registry(MemoryRegistry::new())
            .connector(MemoryNetwork::new())
            .token_factory(Arc::new(NodeTokenFactory::new(
                NodeId(100),
                NodeKeypair::from_seed(&[1; 32]),
                Duration::from_secs(60),
            )))
            .fee_calculator(Arc::new(FixedFeeCalculator::new(
                PicoDollar(1),
                PicoDollar::ZERO,
            )))
    }

    #[test]
    fn test_build_with_required_options() {
        let server = complete().build().unwrap();
        assert_eq!(server.local_node_id(), NodeId(100));
        assert!(server.subscribed_nodes().is_empty());
    }

    #[test]
    fn test_missing_registry() {
        let mut builder = complete();
        builder.registry = None;
        assert!(matches!(
            builder.build(),
            Err(ServerError::MissingOption("node registry"))
        ));
    }

    #[test]
    fn test_missing_node_id() {
        let mut builder = complete();
        builder.local_node_id = None;
        assert!(matches!(
            builder.build(),
            Err(ServerError::MissingOption("local node id"))
        ));
    }

    #[test]
    fn test_keypair_stands_in_for_token_factory() {
        let mut builder = complete();
        builder.token_factory = None;
        assert!(matches!(
            builder.build(),
            Err(ServerError::MissingOption("token factory"))
        ));

        let mut builder = complete().node_keypair(NodeKeypair::from_seed(&[2; 32]));
        builder.token_factory = None;
        assert!(builder.build().is_ok());
    }

    #[test]
    fn test_missing_fee_calculator() {
        let mut builder = complete();
        builder.fee_calculator = None;
        assert!(matches!(
            builder.build(),
            Err(ServerError::MissingOption("fee calculator"))
        ));
    }

    #[tokio::test]
    async fn test_start_and_close_with_empty_registry() {
        let server = complete().build().unwrap();
        server.start().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), server.close())
            .await
            .unwrap();
    }
}
