//! Transport abstraction for the replication protocol.
//!
//! A [`Connector`] dials a peer, a [`Connection`] opens subscription calls on
//! it, and an [`EnvelopeStream`] yields the batches the peer pushes.
//! Implementations may use gRPC, HTTP/2 or anything else that can carry
//! a server stream.

use async_trait::async_trait;
use thiserror::Error;

use crate::auth::AuthInterceptor;
use crate::error::Result;
use crate::messages::{SubscribeEnvelopesRequest, SubscribeEnvelopesResponse};
use crate::registry::Node;

/// How a subscription stream ended.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// The peer closed the stream cleanly.
    #[error("end of stream")]
    Eof,

    /// The call failed with a status message from the peer or the transport.
    #[error("stream status: {0}")]
    Status(String),
}

impl StreamError {
    /// The peer refused our protocol version.
    pub fn is_incompatible(&self) -> bool {
        matches!(self, Self::Status(msg) if msg.contains("not compatible"))
    }
}

/// Receiving half of a subscription call.
#[async_trait]
pub trait EnvelopeStream: Send {
    /// Next batch, or how the stream ended.
    async fn recv(&mut self) -> std::result::Result<SubscribeEnvelopesResponse, StreamError>;
}

/// An open, authenticated connection to one peer.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn subscribe_envelopes(
        &self,
        request: SubscribeEnvelopesRequest,
    ) -> Result<Box<dyn EnvelopeStream>>;
}

/// Dials peers.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `node`. Every call made on the connection carries a token
    /// from `auth`.
    async fn connect(&self, node: &Node, auth: AuthInterceptor) -> Result<Box<dyn Connection>>;
}

/// An in-memory transport for tests.
///
/// Every subscription opened through the network is handed to the test as a
/// [`Subscription`], which plays the peer: it can inspect the request and
/// push batches or errors down the stream.
pub mod memory {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use meshlog_core::{NodeId, RawOriginatorEnvelope};
    use tokio::sync::mpsc;

    use crate::error::SyncError;

    type StreamItem = std::result::Result<SubscribeEnvelopesResponse, StreamError>;

    /// A subscription call as seen by the serving peer.
    #[derive(Debug)]
    pub struct Subscription {
        pub peer: NodeId,
        pub request: SubscribeEnvelopesRequest,
        /// Value of the authorization header sent with the call.
        pub authorization: String,
        sender: mpsc::UnboundedSender<StreamItem>,
    }

    impl Subscription {
        /// Push one batch. Returns `false` if the subscriber has gone away.
        pub fn send_batch(&self, envelopes: Vec<RawOriginatorEnvelope>) -> bool {
            self.sender.send(Ok(envelopes.into())).is_ok()
        }

        /// End the stream with an error.
        pub fn fail(self, error: StreamError) {
            let _ = self.sender.send(Err(error));
        }

        /// End the stream cleanly.
        pub fn end(self) {}

        pub fn is_closed(&self) -> bool {
            self.sender.is_closed()
        }
    }

    /// Shared state of a simulated network.
    pub struct MemoryNetwork {
        subscriptions_tx: mpsc::UnboundedSender<Subscription>,
        subscriptions_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Subscription>>,
        unreachable: Mutex<HashSet<NodeId>>,
        connects: AtomicUsize,
    }

    impl MemoryNetwork {
        pub fn new() -> Arc<Self> {
            let (subscriptions_tx, subscriptions_rx) = mpsc::unbounded_channel();
            Arc::new(Self {
                subscriptions_tx,
                subscriptions_rx: tokio::sync::Mutex::new(subscriptions_rx),
                unreachable: Mutex::new(HashSet::new()),
                connects: AtomicUsize::new(0),
            })
        }

        /// Wait for the next subscription call from any subscriber.
        pub async fn next_subscription(&self) -> Option<Subscription> {
            self.subscriptions_rx.lock().await.recv().await
        }

        /// Like [`next_subscription`](Self::next_subscription) but gives up
        /// after `timeout`.
        pub async fn next_subscription_timeout(&self, timeout: Duration) -> Option<Subscription> {
            tokio::time::timeout(timeout, self.next_subscription())
                .await
                .ok()
                .flatten()
        }

        /// Make connects to `node` fail.
        pub fn set_unreachable(&self, node: NodeId, unreachable: bool) {
            if let Ok(mut set) = self.unreachable.lock() {
                if unreachable {
                    set.insert(node);
                } else {
                    set.remove(&node);
                }
            }
        }

        /// Number of connect attempts so far, successful or not.
        pub fn connect_count(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }

        fn is_unreachable(&self, node: NodeId) -> bool {
            self.unreachable
                .lock()
                .map(|set| set.contains(&node))
                .unwrap_or(false)
        }
    }

    #[async_trait]
    impl Connector for MemoryNetwork {
        async fn connect(&self, node: &Node, auth: AuthInterceptor) -> Result<Box<dyn Connection>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.is_unreachable(node.node_id) {
                return Err(SyncError::Transport(format!(
                    "connection refused: {}",
                    node.http_address
                )));
            }
            Ok(Box::new(MemoryConnection {
                peer: node.node_id,
                auth,
                subscriptions: self.subscriptions_tx.clone(),
            }))
        }
    }

    struct MemoryConnection {
        peer: NodeId,
        auth: AuthInterceptor,
        subscriptions: mpsc::UnboundedSender<Subscription>,
    }

    #[async_trait]
    impl Connection for MemoryConnection {
        async fn subscribe_envelopes(
            &self,
            request: SubscribeEnvelopesRequest,
        ) -> Result<Box<dyn EnvelopeStream>> {
            let authorization = self.auth.authorization()?;
            let (sender, receiver) = mpsc::unbounded_channel();
            self.subscriptions
                .send(Subscription {
                    peer: self.peer,
                    request,
                    authorization,
                    sender,
                })
                .map_err(|_| SyncError::Transport("network shut down".into()))?;
            Ok(Box::new(MemoryEnvelopeStream { receiver }))
        }
    }

    struct MemoryEnvelopeStream {
        receiver: mpsc::UnboundedReceiver<StreamItem>,
    }

    #[async_trait]
    impl EnvelopeStream for MemoryEnvelopeStream {
        async fn recv(&mut self) -> std::result::Result<SubscribeEnvelopesResponse, StreamError> {
            match self.receiver.recv().await {
                Some(item) => item,
                None => Err(StreamError::Eof),
            }
        }
    }
}
