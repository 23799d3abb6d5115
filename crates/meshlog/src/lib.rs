//! # Meshlog
//!
//! Cross-node replication for a network of nodes that each originate their
//! own ordered envelope log.
//!
//! Every node subscribes to every peer listed in the node registry, pulls
//! the envelopes that peer originated, validates them and stores them with
//! the fees they incur. Subscriptions resume from the local vector clock and
//! are rebuilt whenever a peer's registry entry changes.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use meshlog::{SyncServer, Result};
//! use meshlog::core::NodeId;
//! use meshlog::store::SqliteStore;
//! use meshlog::sync::{Connector, FeeCalculator, NodeRegistry, TokenFactory};
//!
//! async fn example(
//!     registry: Arc<dyn NodeRegistry>,
//!     connector: Arc<dyn Connector>,
//!     tokens: Arc<dyn TokenFactory>,
//!     fees: Arc<dyn FeeCalculator>,
//! ) -> Result<()> {
//!     let store = Arc::new(SqliteStore::open("meshlog.db").unwrap());
//!
//!     let server = SyncServer::builder()
//!         .local_node_id(NodeId(100))
//!         .store(store)
//!         .registry(registry)
//!         .connector(connector)
//!         .token_factory(tokens)
//!         .fee_calculator(fees)
//!         .build()?;
//!
//!     server.start().await?;
//!     // ... later
//!     server.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `meshlog::core` - Envelopes, topics, cursors, keys
//! - `meshlog::store` - Storage abstraction and SQLite
//! - `meshlog::sync` - Streams, sinks, registry watching, the sync worker

pub mod error;
pub mod server;

pub use meshlog_core as core;
pub use meshlog_store as store;
pub use meshlog_sync as sync;

pub use error::{Result, ServerError};
pub use server::{SyncServer, SyncServerBuilder};

pub use meshlog_core::{NodeId, OriginatorEnvelope, PayerId, PicoDollar, Topic, TopicKind};
pub use meshlog_sync::{MigrationConfig, SyncConfig};
