//! Proptest generators for property-based testing.

use std::collections::HashMap;

use proptest::prelude::*;

use meshlog_core::{NodeId, SequenceId};

/// First originator id handed out by [`interleaved_deliveries`].
pub const FIRST_ORIGINATOR: u32 = 200;

/// Generate a delivery order for several originators sharing one stream.
///
/// Each originator's sequence ids run `1..=n` without gaps, but the
/// originators are shuffled together arbitrarily.
pub fn interleaved_deliveries(
    max_originators: usize,
    max_per_originator: u64,
) -> impl Strategy<Value = Vec<(NodeId, SequenceId)>> {
    prop::collection::vec(1..=max_per_originator, 1..=max_originators)
        .prop_flat_map(|counts| {
            let slots: Vec<u32> = counts
                .iter()
                .enumerate()
                .flat_map(|(i, &n)| std::iter::repeat(i as u32).take(n as usize))
                .collect();
            Just(slots).prop_shuffle()
        })
        .prop_map(|slots| {
            let mut next: HashMap<u32, SequenceId> = HashMap::new();
            slots
                .into_iter()
                .map(|slot| {
                    let seq = next.entry(slot).or_insert(0);
                    *seq += 1;
                    (NodeId(FIRST_ORIGINATOR + slot), *seq)
                })
                .collect()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn test_each_originator_is_gapless(deliveries in interleaved_deliveries(4, 8)) {
            let mut last: HashMap<NodeId, SequenceId> = HashMap::new();
            for (originator, seq) in deliveries {
                let prev = last.insert(originator, seq).unwrap_or(0);
                prop_assert_eq!(seq, prev + 1);
            }
        }
    }
}
