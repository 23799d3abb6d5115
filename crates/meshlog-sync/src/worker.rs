//! The sync worker: one self-healing subscription per known peer.
//!
//! For every peer the worker runs three tasks: an [`EnvelopeSink`] draining a
//! bounded write queue, a [`NodeRegistryWatcher`] and a supervisor that keeps
//! connecting, subscribing and listening until shutdown.
//!
//! ```text
//!   registry ──new nodes──► SyncWorker ──spawn──► supervisor ──► OriginatorStream
//!      │                                              ▲                 │
//!      └──node changed──► watcher ──cancel────────────┘        write queue (bounded)
//!                                                                       ▼
//!                                                                 EnvelopeSink ──► Store
//! ```
//!
//! Cancellation is a tree: the worker token is a child of the caller's, and
//! each registration token (one connect-and-listen lifetime) is a child of
//! the worker token. A registry change cancels only the current
//! registration; the supervisor then rebuilds it from the latest entry.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

use meshlog_core::{DomainSeparator, NodeId, OriginatorCursor, OriginatorEnvelope, VectorClock};
use meshlog_store::Store;

use crate::auth::{AuthInterceptor, TokenFactory};
use crate::backoff::{sleep_or_cancel, ExponentialBackoff};
use crate::config::{migration_originators, SyncConfig};
use crate::error::Result;
use crate::fees::FeeCalculator;
use crate::messages::SubscribeEnvelopesRequest;
use crate::payer_report::PayerReportStore;
use crate::registry::{Node, NodeRegistry};
use crate::sink::EnvelopeSink;
use crate::stream::{OriginatorStream, StreamExit};
use crate::transport::{Connection, Connector};
use crate::watcher::NodeRegistryWatcher;

/// Everything the worker talks to.
pub struct Collaborators<S> {
    pub local_node_id: NodeId,
    pub store: Arc<S>,
    pub registry: Arc<dyn NodeRegistry>,
    pub connector: Arc<dyn Connector>,
    pub token_factory: Arc<dyn TokenFactory>,
    pub fee_calculator: Arc<dyn FeeCalculator>,
    pub payer_reports: Arc<dyn PayerReportStore>,
    pub domain_separator: DomainSeparator,
}

impl<S> Clone for Collaborators<S> {
    fn clone(&self) -> Self {
        Self {
            local_node_id: self.local_node_id,
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            connector: Arc::clone(&self.connector),
            token_factory: Arc::clone(&self.token_factory),
            fee_calculator: Arc::clone(&self.fee_calculator),
            payer_reports: Arc::clone(&self.payer_reports),
            domain_separator: self.domain_separator,
        }
    }
}

/// Peers with a running supervisor.
#[derive(Default)]
struct SubscriptionSet(Mutex<BTreeSet<NodeId>>);

impl SubscriptionSet {
    /// Returns `false` if `node_id` was already present.
    fn insert(&self, node_id: NodeId) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node_id)
    }

    fn snapshot(&self) -> Vec<NodeId> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }
}

pub struct SyncWorker<S> {
    inner: Arc<Inner<S>>,
}

struct Inner<S> {
    collab: Collaborators<S>,
    config: SyncConfig,
    token: CancellationToken,
    tracker: TaskTracker,
    subscriptions: SubscriptionSet,
}

impl<S: Store + 'static> SyncWorker<S> {
    /// The worker stops when `parent` is cancelled or on [`close`](Self::close).
    pub fn new(collab: Collaborators<S>, config: SyncConfig, parent: &CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                collab,
                config,
                token: parent.child_token(),
                tracker: TaskTracker::new(),
                subscriptions: SubscriptionSet::default(),
            }),
        }
    }

    /// Subscribe to every known peer and to peers added later.
    pub async fn start(&self) -> Result<()> {
        info!(node_id = %self.inner.collab.local_node_id, "starting sync worker");

        // Listen before taking the snapshot so no node added in between is
        // missed. Duplicates are filtered by the subscription set.
        self.inner.subscribe_to_registry();

        let nodes = self.inner.collab.registry.get_nodes().await?;
        for node in nodes {
            self.inner.subscribe_to_node(node.node_id);
        }
        Ok(())
    }

    /// Cancel every task and wait for all of them to finish.
    pub async fn close(&self) {
        debug!("stopping sync worker");
        self.inner.token.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        debug!("sync worker stopped");
    }

    pub fn subscribed_nodes(&self) -> Vec<NodeId> {
        self.inner.subscriptions.snapshot()
    }
}

impl<S: Store + 'static> Inner<S> {
    fn subscribe_to_registry(self: &Arc<Self>) {
        let mut new_nodes = self.collab.registry.on_new_nodes();
        let inner = Arc::clone(self);

        self.tracker.spawn(
            async move {
                loop {
                    tokio::select! {
                        _ = inner.token.cancelled() => return,
                        batch = new_nodes.recv() => {
                            let Some(nodes) = batch else { return };
                            let ids: Vec<NodeId> = nodes.iter().map(|n| n.node_id).collect();
                            info!(nodes = ?ids, "new nodes received");
                            for id in ids {
                                inner.subscribe_to_node(id);
                            }
                        }
                    }
                }
            }
            .instrument(info_span!("registry_listener")),
        );
    }

    fn subscribe_to_node(self: &Arc<Self>, node_id: NodeId) {
        if node_id == self.collab.local_node_id {
            return;
        }
        if !self.subscriptions.insert(node_id) {
            return;
        }

        let (write_queue, queue_rx) = mpsc::channel(self.config.write_queue_capacity);

        let sink = EnvelopeSink::new(
            Arc::clone(&self.collab.store),
            Arc::clone(&self.collab.fee_calculator),
            Arc::clone(&self.collab.payer_reports),
            self.collab.domain_separator,
            queue_rx,
            self.token.clone(),
        )
        .with_backoff(self.config.sink_backoff.clone());
        self.tracker
            .spawn(sink.run().instrument(info_span!("envelope_sink", peer = %node_id)));

        let watcher = NodeRegistryWatcher::new(node_id, Arc::clone(&self.collab.registry));
        watcher.watch(self.token.clone(), &self.tracker);

        let inner = Arc::clone(self);
        self.tracker.spawn(
            async move { inner.supervise(node_id, watcher, write_queue).await }
                .instrument(info_span!("node_subscription", peer = %node_id)),
        );
    }

    /// Rebuild the registration until shutdown. Dropping `write_queue` on
    /// return closes the sink's queue.
    async fn supervise(
        &self,
        node_id: NodeId,
        watcher: Arc<NodeRegistryWatcher>,
        write_queue: mpsc::Sender<OriginatorEnvelope>,
    ) {
        while !self.token.is_cancelled() {
            let registration = self.token.child_token();
            watcher.register_cancel(registration.clone());
            self.run_registration(node_id, &registration, &write_queue)
                .await;
        }
    }

    /// One registration: look up the node, then connect and listen under
    /// backoff until the registration is cancelled.
    async fn run_registration(
        &self,
        node_id: NodeId,
        registration: &CancellationToken,
        write_queue: &mpsc::Sender<OriginatorEnvelope>,
    ) {
        let mut backoff = ExponentialBackoff::new(self.config.stream_backoff.clone());

        let node = loop {
            match self.collab.registry.get_node(node_id).await {
                Ok(node) => break node,
                Err(e) => {
                    error!(error = %e, "unexpected state: failed to get node from registry");
                    if !sleep_or_cancel(registration, backoff.next_delay()).await {
                        return;
                    }
                }
            }
        };

        if !node.is_usable() {
            info!(
                healthy = node.is_healthy,
                valid_config = node.is_valid_config,
                "node is not usable, waiting for a registry change"
            );
            registration.cancelled().await;
            debug!("node configuration has changed, closing stream and connection");
            return;
        }

        loop {
            let exit = tokio::select! {
                biased;

                _ = registration.cancelled() => return,
                exit = self.attempt(&node, registration, write_queue) => exit,
            };

            let delay = match exit {
                StreamExit::Cancelled => return,
                StreamExit::RetryAfter(delay) => delay,
                StreamExit::Failed(e) => {
                    if !self.token.is_cancelled() {
                        warn!(
                            address = %node.http_address,
                            error = %e,
                            "error connecting to node, retrying"
                        );
                    }
                    backoff.next_delay()
                }
            };

            if !sleep_or_cancel(registration, delay).await {
                return;
            }
        }
    }

    /// Connect, subscribe and listen once.
    async fn attempt(
        &self,
        node: &Node,
        registration: &CancellationToken,
        write_queue: &mpsc::Sender<OriginatorEnvelope>,
    ) -> StreamExit {
        let connection = match self.connect_to_node(node).await {
            Ok(connection) => connection,
            Err(e) => return StreamExit::Failed(e),
        };
        let mut stream = match self
            .setup_stream(node, connection.as_ref(), registration, write_queue)
            .await
        {
            Ok(stream) => stream,
            Err(e) => return StreamExit::Failed(e),
        };
        stream.listen().await
    }

    async fn connect_to_node(&self, node: &Node) -> Result<Box<dyn Connection>> {
        info!(address = %node.http_address, "attempting to connect to node");

        let auth = AuthInterceptor::new(Arc::clone(&self.collab.token_factory), node.node_id);
        let connection = match self.collab.connector.connect(node, auth).await {
            Ok(connection) => connection,
            Err(e) => {
                error!(address = %node.http_address, error = %e, "failed to connect to node");
                return Err(e);
            }
        };

        debug!(address = %node.http_address, "successfully opened a connection to node");
        Ok(connection)
    }

    /// Open the subscription, resuming from the local vector clock.
    async fn setup_stream(
        &self,
        node: &Node,
        connection: &dyn Connection,
        registration: &CancellationToken,
        write_queue: &mpsc::Sender<OriginatorEnvelope>,
    ) -> Result<OriginatorStream> {
        let entries = self.collab.store.select_vector_clock().await?;
        let clock: VectorClock = entries
            .iter()
            .map(|e| (e.originator_node_id, e.originator_sequence_id))
            .collect();
        let originators = self.originator_ids_for(node.node_id);

        info!(vector_clock = ?clock, originators = ?originators, "vector clock for sync subscription");

        let request = SubscribeEnvelopesRequest::new(&originators, &clock);
        let envelopes = match connection.subscribe_envelopes(request).await {
            Ok(envelopes) => envelopes,
            Err(e) => {
                error!(address = %node.http_address, error = %e, "failed to batch subscribe to node");
                return Err(e);
            }
        };

        let last_seen: HashMap<NodeId, OriginatorCursor> = entries
            .into_iter()
            .filter(|e| originators.contains(&e.originator_node_id))
            .map(|e| {
                (
                    e.originator_node_id,
                    OriginatorCursor {
                        sequence_id: e.originator_sequence_id,
                        timestamp_ns: e.gateway_time_ns,
                    },
                )
            })
            .collect();

        Ok(OriginatorStream::new(
            node.node_id,
            envelopes,
            last_seen,
            originators,
            write_queue.clone(),
            registration.clone(),
        )
        .with_retry_delays(
            self.config.eof_retry_delay,
            self.config.incompatible_retry_delay,
        ))
    }

    /// The peer itself, plus the migration originators when the peer is the
    /// migration source.
    fn originator_ids_for(&self, node_id: NodeId) -> Vec<NodeId> {
        let mut ids = vec![node_id];
        let migration = self.config.migration;
        if migration.enable
            && node_id == migration.from_node_id
            && node_id != self.collab.local_node_id
        {
            ids.extend(migration_originators::REPLICATED);
        }
        ids
    }
}
