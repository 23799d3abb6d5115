//! End-to-end replication into an on-disk SQLite store.
//!
//! Peers are simulated with the in-memory registry and network; the local
//! node runs a full `SyncServer` with the default payer report store.

use std::sync::Arc;
use std::time::Duration;

use meshlog::core::{NodeKeypair, Payload, PicoDollar};
use meshlog::store::{SqliteStore, Store};
use meshlog::sync::registry::memory::MemoryRegistry;
use meshlog::sync::testing::FixedFeeCalculator;
use meshlog::sync::transport::memory::{MemoryNetwork, Subscription};
use meshlog::sync::{minutes_since_epoch, Node, NodeTokenFactory, SyncConfig};
use meshlog::{NodeId, SyncServer, Topic, TopicKind};
use meshlog_testkit::{timestamp_for, EnvelopeFactory};
use tempfile::TempDir;

const LOCAL: NodeId = NodeId(100);
const WAIT: Duration = Duration::from_secs(5);

struct LocalNode {
    _dir: TempDir,
    store: Arc<SqliteStore>,
    registry: Arc<MemoryRegistry>,
    network: Arc<MemoryNetwork>,
    server: SyncServer<SqliteStore>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn fast_config() -> SyncConfig {
    let mut config = SyncConfig {
        eof_retry_delay: Duration::from_millis(5),
        ..SyncConfig::default()
    };
    config.stream_backoff.initial_interval = Duration::from_millis(5);
    config.sink_backoff.initial_interval = Duration::from_millis(5);
    config
}

fn local_node(peers: &[u32]) -> LocalNode {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteStore::open(dir.path().join("meshlog.db")).unwrap());
    let registry = MemoryRegistry::with_nodes(
        peers
            .iter()
            .map(|&id| Node::new(NodeId(id), format!("http://node-{id}"))),
    );
    let network = MemoryNetwork::new();

    let server = SyncServer::builder()
        .local_node_id(LOCAL)
        .store(Arc::clone(&store))
        .registry(registry.clone())
        .connector(network.clone())
        .token_factory(Arc::new(NodeTokenFactory::new(
            LOCAL,
            NodeKeypair::from_seed(&[9; 32]),
            Duration::from_secs(60),
        )))
        .fee_calculator(Arc::new(FixedFeeCalculator::new(
            PicoDollar(100),
            PicoDollar(5),
        )))
        .config(fast_config())
        .build()
        .unwrap();

    LocalNode {
        _dir: dir,
        store,
        registry,
        network,
        server,
    }
}

async fn next_sub(network: &MemoryNetwork) -> Subscription {
    network
        .next_subscription_timeout(WAIT)
        .await
        .expect("subscription opened")
}

async fn wait_for_envelopes(store: &SqliteStore, originator: NodeId, count: usize) {
    for _ in 0..500 {
        let stored = store.gateway_envelopes_by_originator(originator).await.unwrap();
        if stored.len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {count} envelopes from originator {originator}");
}

#[tokio::test]
async fn test_replicates_from_every_peer() {
    let node = local_node(&[200, 300]);
    node.server.start().await.unwrap();

    let mut subs = vec![next_sub(&node.network).await, next_sub(&node.network).await];
    subs.sort_by_key(|s| s.peer);

    let a = EnvelopeFactory::new(NodeId(200));
    let b = EnvelopeFactory::new(NodeId(300));
    subs[0].send_batch(vec![a.raw(1), a.raw(2), a.raw(3)]);
    subs[1].send_batch(vec![b.raw(1)]);

    wait_for_envelopes(&node.store, NodeId(200), 3).await;
    wait_for_envelopes(&node.store, NodeId(300), 1).await;

    let clock = node.store.select_vector_clock().await.unwrap();
    assert_eq!(clock.len(), 2);

    let payer_id = node
        .store
        .find_or_create_payer(&a.payer().address())
        .await
        .unwrap();
    let usage = node
        .store
        .unsettled_usage(payer_id, NodeId(200), minutes_since_epoch(timestamp_for(1)))
        .await
        .unwrap()
        .expect("usage recorded");
    assert_eq!(usage.spend, PicoDollar(315));
    assert_eq!(usage.message_count, 3);
    assert_eq!(usage.last_sequence_id, 3);

    node.server.close().await;
}

#[tokio::test]
async fn test_resumes_after_peer_disconnect() {
    let node = local_node(&[200]);
    node.server.start().await.unwrap();
    let factory = EnvelopeFactory::new(NodeId(200));

    let sub = next_sub(&node.network).await;
    sub.send_batch(vec![factory.raw(1), factory.raw(2)]);
    wait_for_envelopes(&node.store, NodeId(200), 2).await;
    sub.end();

    let resumed = next_sub(&node.network).await;
    assert_eq!(resumed.request.last_seen().get(NodeId(200)), 2);

    // A peer replaying from an older point is harmless.
    resumed.send_batch(vec![factory.raw(2), factory.raw(3)]);
    wait_for_envelopes(&node.store, NodeId(200), 3).await;
    assert_eq!(
        node.store
            .gateway_envelopes_by_originator(NodeId(200))
            .await
            .unwrap()
            .len(),
        3
    );

    node.server.close().await;
}

#[tokio::test]
async fn test_payer_reports_are_persisted_without_usage() {
    let node = local_node(&[200]);
    node.server.start().await.unwrap();
    let factory = EnvelopeFactory::new(NodeId(200));

    let sub = next_sub(&node.network).await;
    sub.send_batch(vec![factory.raw_with_payload(
        1,
        Topic::new(TopicKind::PayerReportsV1, vec![7]),
        Payload::PayerReport(vec![1, 2, 3].into()),
    )]);
    wait_for_envelopes(&node.store, NodeId(200), 1).await;

    let payer_id = node
        .store
        .find_or_create_payer(&factory.payer().address())
        .await
        .unwrap();
    let usage = node
        .store
        .unsettled_usage(payer_id, NodeId(200), minutes_since_epoch(timestamp_for(1)))
        .await
        .unwrap();
    assert!(usage.is_none());

    node.server.close().await;
}

#[tokio::test]
async fn test_new_peer_joins_while_running() {
    let node = local_node(&[200]);
    node.server.start().await.unwrap();
    let _first = next_sub(&node.network).await;

    node.registry
        .add_node(Node::new(NodeId(400), "http://node-400"));
    let sub = next_sub(&node.network).await;
    assert_eq!(sub.peer, NodeId(400));

    sub.send_batch(vec![EnvelopeFactory::new(NodeId(400)).raw(1)]);
    wait_for_envelopes(&node.store, NodeId(400), 1).await;
    assert_eq!(node.server.subscribed_nodes(), vec![NodeId(200), NodeId(400)]);

    node.server.close().await;
}
