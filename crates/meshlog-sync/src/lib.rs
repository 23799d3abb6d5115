//! # Meshlog Sync
//!
//! Cross-node replication: every node pulls the envelopes originated by each
//! of its peers and persists them locally, together with the payer usage
//! they incur.
//!
//! ## Overview
//!
//! A [`SyncWorker`] subscribes to every peer in the [`NodeRegistry`]. Each
//! subscription is a pipeline:
//!
//! - An [`OriginatorStream`] receives envelope batches from the peer,
//!   validates them and tracks per-originator cursors.
//! - A bounded write queue carries accepted envelopes to the sink.
//! - An [`EnvelopeSink`] computes fees, resolves the payer and stores the
//!   envelope with its usage increment, retrying failures forever.
//!
//! A [`NodeRegistryWatcher`] tears the subscription down whenever the
//! peer's registry entry changes, and the worker rebuilds it.
//!
//! ## Key Properties
//!
//! - **Resumable**: subscriptions restart from the local vector clock
//! - **Idempotent**: storing an envelope twice is a no-op
//! - **Self-healing**: failed connections are retried with backoff
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use meshlog_sync::{Collaborators, SyncConfig, SyncWorker};
//! use meshlog_store::MemoryStore;
//! use tokio_util::sync::CancellationToken;
//!
//! async fn example(collab: Collaborators<MemoryStore>) -> meshlog_sync::Result<()> {
//!     let shutdown = CancellationToken::new();
//!     let worker = SyncWorker::new(collab, SyncConfig::default(), &shutdown);
//!     worker.start().await?;
//!
//!     // ... later
//!     worker.close().await;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod backoff;
pub mod config;
pub mod error;
pub mod fees;
pub mod messages;
pub mod payer_report;
pub mod registry;
pub mod sink;
pub mod stream;
pub mod testing;
pub mod transport;
pub mod watcher;
pub mod worker;

pub use auth::{AuthInterceptor, AuthToken, NodeTokenFactory, TokenClaims, TokenFactory};
pub use backoff::ExponentialBackoff;
pub use config::{migration_originators, BackoffConfig, MigrationConfig, SyncConfig};
pub use error::{Result, SyncError};
pub use fees::{minutes_since_epoch, FeeCalculator};
pub use messages::{EnvelopesQuery, SubscribeEnvelopesRequest, SubscribeEnvelopesResponse};
pub use payer_report::{GatewayPayerReportStore, PayerReportStore};
pub use registry::{Node, NodeRegistry};
pub use sink::EnvelopeSink;
pub use stream::{OriginatorStream, StreamExit, StreamStats};
pub use transport::{Connection, Connector, EnvelopeStream, StreamError};
pub use watcher::NodeRegistryWatcher;
pub use worker::{Collaborators, SyncWorker};
