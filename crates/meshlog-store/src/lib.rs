//! # meshlog store
//!
//! Storage for replicated gateway envelopes, payers and unsettled usage.
//!
//! ## Overview
//!
//! Storage sits behind the [`Store`] trait so the replication engine is
//! backend-agnostic. [`SqliteStore`] is the primary implementation and
//! [`MemoryStore`] mirrors its semantics for tests.
//!
//! ## Key Types
//!
//! - [`Store`] - The async trait for all storage operations
//! - [`GatewayEnvelope`] - A persisted envelope row
//! - [`UsageIncrement`] - Spend attributed to a payer on first insert
//! - [`ErrorClass`] - Retry classification of a [`StoreError`]
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshlog_store::{SqliteStore, StoreExt};
//!
//! async fn example() {
//!     let store = SqliteStore::open("meshlog.db").unwrap();
//!
//!     // What to ask peers for when resuming.
//!     let clock = store.vector_clock().await.unwrap();
//!     println!("{} originators known", clock.len());
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Idempotent inserts**: an existing `(originator, sequence)` key reports zero rows
//! - **Usage only on first insert**: replays never double-bill a payer
//! - **Immutable rows**: envelopes are never updated after insert

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{ErrorClass, Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{
    GatewayEnvelope, Store, StoreExt, UnsettledUsage, UsageIncrement, VectorClockEntry,
};
