//! Per-originator high-water marks.
//!
//! [`VectorClock`] records the last persisted sequence id of every
//! originator and is what a node sends to a peer to resume streaming.
//! [`Cursor`] is its wire form. [`OriginatorCursor`] is the last envelope
//! identity a single stream accepted for one originator.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{NodeId, SequenceId};

/// Wire form of a vector clock.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub node_id_to_sequence_id: BTreeMap<u32, u64>,
}

/// Mapping of originator → last persisted sequence id.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VectorClock(BTreeMap<NodeId, SequenceId>);

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last sequence id for an originator, 0 if none has been seen.
    pub fn get(&self, originator: NodeId) -> SequenceId {
        self.0.get(&originator).copied().unwrap_or(0)
    }

    /// Raise the entry for `originator` to `sequence_id` if it is higher.
    pub fn advance(&mut self, originator: NodeId, sequence_id: SequenceId) {
        let entry = self.0.entry(originator).or_insert(0);
        if sequence_id > *entry {
            *entry = sequence_id;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, SequenceId)> + '_ {
        self.0.iter().map(|(k, v)| (*k, *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_cursor(&self) -> Cursor {
        Cursor {
            node_id_to_sequence_id: self.0.iter().map(|(k, v)| (k.get(), *v)).collect(),
        }
    }
}

impl From<&Cursor> for VectorClock {
    fn from(cursor: &Cursor) -> Self {
        Self(
            cursor
                .node_id_to_sequence_id
                .iter()
                .map(|(k, v)| (NodeId(*k), *v))
                .collect(),
        )
    }
}

impl FromIterator<(NodeId, SequenceId)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (NodeId, SequenceId)>>(iter: I) -> Self {
        let mut clock = Self::new();
        for (node, seq) in iter {
            clock.advance(node, seq);
        }
        clock
    }
}

/// Last accepted envelope identity for one originator on one stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OriginatorCursor {
    pub sequence_id: SequenceId,
    pub timestamp_ns: i64,
}
