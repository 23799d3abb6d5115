//! # meshlog testkit
//!
//! Testing utilities for meshlog.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: [`EnvelopeFactory`] builds envelopes with real payer
//!   signatures, plus deliberately broken ones for the drop paths
//! - **Generators**: Proptest strategies for property-based testing
//!
//! ## Test Fixtures
//!
//! ```rust
//! use meshlog_core::NodeId;
//! use meshlog_testkit::EnvelopeFactory;
//!
//! let factory = EnvelopeFactory::new(NodeId(200));
//! let envelope = factory.envelope(1);
//! assert_eq!(envelope.sequence_id(), 1);
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use meshlog_testkit::generators::interleaved_deliveries;
//!
//! proptest! {
//!     #[test]
//!     fn cursors_track_each_originator(deliveries in interleaved_deliveries(3, 10)) {
//!         // feed `deliveries` through a stream
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{corrupted_envelope, payload_for, timestamp_for, EnvelopeFactory};
pub use generators::interleaved_deliveries;
