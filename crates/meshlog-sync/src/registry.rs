//! Node registry abstraction.
//!
//! The registry is the source of truth for which peers exist and how to
//! reach them. Replication only reads it and listens for changes.

use async_trait::async_trait;
use tokio::sync::mpsc;

use meshlog_core::{NodeId, NodePublicKey};

use crate::error::Result;

/// A peer as described by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub node_id: NodeId,
    pub http_address: String,
    pub signing_key: Option<NodePublicKey>,
    pub is_healthy: bool,
    pub is_valid_config: bool,
}

impl Node {
    /// A healthy, validly configured node.
    pub fn new(node_id: NodeId, http_address: impl Into<String>) -> Self {
        Self {
            node_id,
            http_address: http_address.into(),
            signing_key: None,
            is_healthy: true,
            is_valid_config: true,
        }
    }

    /// Whether a subscription should be attempted at all.
    pub fn is_usable(&self) -> bool {
        self.is_healthy && self.is_valid_config
    }
}

/// Read access to the node registry plus change notifications.
///
/// Notification receivers are registered eagerly: anything that happens
/// after the call returns is delivered.
#[async_trait]
pub trait NodeRegistry: Send + Sync {
    /// Snapshot of all known nodes.
    async fn get_nodes(&self) -> Result<Vec<Node>>;

    /// Latest entry for one node.
    async fn get_node(&self, node_id: NodeId) -> Result<Node>;

    /// Batches of newly added nodes.
    fn on_new_nodes(&self) -> mpsc::Receiver<Vec<Node>>;

    /// Updated entries for one node.
    fn on_changed_node(&self, node_id: NodeId) -> mpsc::Receiver<Node>;
}

/// An in-memory registry for tests.
pub mod memory {
    use super::*;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::{Arc, Mutex};

    use tokio::sync::mpsc::error::TrySendError;

    use crate::error::SyncError;

    const LISTENER_CAPACITY: usize = 16;

    #[derive(Default)]
    struct Inner {
        nodes: BTreeMap<NodeId, Node>,
        new_node_listeners: Vec<mpsc::Sender<Vec<Node>>>,
        changed_listeners: HashMap<NodeId, Vec<mpsc::Sender<Node>>>,
    }

    /// Registry backed by a map, with synchronous notification fan-out.
    #[derive(Default)]
    pub struct MemoryRegistry {
        inner: Mutex<Inner>,
    }

    impl MemoryRegistry {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn with_nodes(nodes: impl IntoIterator<Item = Node>) -> Arc<Self> {
            let registry = Self::default();
            if let Ok(mut inner) = registry.inner.lock() {
                inner.nodes = nodes.into_iter().map(|n| (n.node_id, n)).collect();
            }
            Arc::new(registry)
        }

        /// Add a node, or update it if it already exists.
        pub fn add_node(&self, node: Node) {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            if inner.nodes.insert(node.node_id, node.clone()).is_some() {
                notify_changed(&mut inner, node);
            } else {
                let batch = vec![node];
                inner
                    .new_node_listeners
                    .retain(|tx| still_open(tx.try_send(batch.clone())));
            }
        }

        /// Replace an existing node's entry and notify its watchers.
        pub fn update_node(&self, node: Node) {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            inner.nodes.insert(node.node_id, node.clone());
            notify_changed(&mut inner, node);
        }

        /// Drop every listener, closing their channels.
        pub fn close(&self) {
            if let Ok(mut inner) = self.inner.lock() {
                inner.new_node_listeners.clear();
                inner.changed_listeners.clear();
            }
        }
    }

    fn notify_changed(inner: &mut Inner, node: Node) {
        if let Some(listeners) = inner.changed_listeners.get_mut(&node.node_id) {
            listeners.retain(|tx| still_open(tx.try_send(node.clone())));
        }
    }

    /// A full listener misses this notification but stays registered.
    fn still_open<T>(result: std::result::Result<(), TrySendError<T>>) -> bool {
        !matches!(result, Err(TrySendError::Closed(_)))
    }

    #[async_trait]
    impl NodeRegistry for MemoryRegistry {
        async fn get_nodes(&self) -> Result<Vec<Node>> {
            let inner = self
                .inner
                .lock()
                .map_err(|e| SyncError::Registry(e.to_string()))?;
            Ok(inner.nodes.values().cloned().collect())
        }

        async fn get_node(&self, node_id: NodeId) -> Result<Node> {
            let inner = self
                .inner
                .lock()
                .map_err(|e| SyncError::Registry(e.to_string()))?;
            inner
                .nodes
                .get(&node_id)
                .cloned()
                .ok_or(SyncError::NodeNotFound(node_id))
        }

        fn on_new_nodes(&self) -> mpsc::Receiver<Vec<Node>> {
            let (tx, rx) = mpsc::channel(LISTENER_CAPACITY);
            if let Ok(mut inner) = self.inner.lock() {
                inner.new_node_listeners.push(tx);
            }
            rx
        }

        fn on_changed_node(&self, node_id: NodeId) -> mpsc::Receiver<Node> {
            let (tx, rx) = mpsc::channel(LISTENER_CAPACITY);
            if let Ok(mut inner) = self.inner.lock() {
                inner.changed_listeners.entry(node_id).or_default().push(tx);
            }
            rx
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn test_new_node_notification() {
            let registry = MemoryRegistry::with_nodes([Node::new(NodeId(100), "http://a")]);
            let mut new_nodes = registry.on_new_nodes();

            registry.add_node(Node::new(NodeId(200), "http://b"));

            let batch = new_nodes.recv().await.unwrap();
            assert_eq!(batch.len(), 1);
            assert_eq!(batch[0].node_id, NodeId(200));
            assert_eq!(registry.get_nodes().await.unwrap().len(), 2);
        }

        #[tokio::test]
        async fn test_changed_node_notification() {
            let registry = MemoryRegistry::with_nodes([Node::new(NodeId(100), "http://a")]);
            let mut changes = registry.on_changed_node(NodeId(100));
            let mut other = registry.on_changed_node(NodeId(200));

            let mut updated = Node::new(NodeId(100), "http://a2");
            updated.is_healthy = false;
            registry.update_node(updated.clone());

            assert_eq!(changes.recv().await.unwrap(), updated);
            assert!(other.try_recv().is_err());
            assert_eq!(registry.get_node(NodeId(100)).await.unwrap(), updated);
        }

        #[tokio::test]
        async fn test_missing_node() {
            let registry = MemoryRegistry::new();
            assert!(matches!(
                registry.get_node(NodeId(5)).await,
                Err(SyncError::NodeNotFound(NodeId(5)))
            ));
        }

        #[tokio::test]
        async fn test_close_ends_listeners() {
            let registry = MemoryRegistry::new();
            let mut changes = registry.on_changed_node(NodeId(1));
            registry.close();
            assert!(changes.recv().await.is_none());
        }
    }
}
