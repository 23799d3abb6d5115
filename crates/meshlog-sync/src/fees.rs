//! Fee calculation seam.
//!
//! Replication recomputes every envelope's fee locally and bills the local
//! figure. The arithmetic lives behind [`FeeCalculator`].

use async_trait::async_trait;

use meshlog_core::{NodeId, PicoDollar};
use meshlog_store::Store;

use crate::error::Result;

const NANOS_PER_MINUTE: i64 = 60 * 1_000_000_000;

/// Computes the fees an envelope should have been charged.
#[async_trait]
pub trait FeeCalculator: Send + Sync {
    /// Storage fee for a payload of `payload_len` bytes kept for
    /// `retention_days`, at time `at_ns`.
    fn calculate_base_fee(
        &self,
        at_ns: i64,
        payload_len: u64,
        retention_days: u32,
    ) -> Result<PicoDollar>;

    /// Surcharge for `originator`'s load around `at_ns`. Reads recent
    /// congestion through `store`.
    async fn calculate_congestion_fee(
        &self,
        store: &dyn Store,
        at_ns: i64,
        originator: NodeId,
    ) -> Result<PicoDollar>;
}

/// The usage bucket a unix-nanosecond timestamp falls in.
pub fn minutes_since_epoch(ns: i64) -> i64 {
    ns.div_euclid(NANOS_PER_MINUTE)
}
