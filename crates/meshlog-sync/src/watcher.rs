//! Cancels a peer's current registration when its registry entry changes.

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, info_span, Instrument};

use meshlog_core::NodeId;

use crate::registry::NodeRegistry;

/// Watches one node's registry entry.
///
/// Each change cancels the token registered with
/// [`register_cancel`](Self::register_cancel) exactly once and forgets it.
/// Changes arriving while nothing is registered are ignored.
pub struct NodeRegistryWatcher {
    node_id: NodeId,
    registry: Arc<dyn NodeRegistry>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl NodeRegistryWatcher {
    pub fn new(node_id: NodeId, registry: Arc<dyn NodeRegistry>) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            registry,
            cancel: Mutex::new(None),
        })
    }

    /// Cancel `token` on the next change, replacing any earlier token.
    pub fn register_cancel(&self, token: CancellationToken) {
        if let Ok(mut slot) = self.cancel.lock() {
            *slot = Some(token);
        }
    }

    fn trigger(&self) {
        let token = self.cancel.lock().ok().and_then(|mut slot| slot.take());
        if let Some(token) = token {
            token.cancel();
        }
    }

    /// Start watching on `tracker` until `parent` is cancelled or the
    /// registry stops sending updates.
    pub fn watch(self: &Arc<Self>, parent: CancellationToken, tracker: &TaskTracker) {
        let mut changes = self.registry.on_changed_node(self.node_id);
        let watcher = Arc::clone(self);
        let span = info_span!("registry_watcher", peer = %self.node_id);

        tracker.spawn(
            async move {
                loop {
                    tokio::select! {
                        _ = parent.cancelled() => {
                            watcher.trigger();
                            return;
                        }
                        change = changes.recv() => {
                            info!("node has been updated in the registry, terminating and rebuilding");
                            watcher.trigger();
                            if change.is_none() {
                                info!("node registry channel closed");
                                return;
                            }
                        }
                    }
                }
            }
            .instrument(span),
        );
    }
}
