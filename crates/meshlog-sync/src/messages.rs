//! Replication protocol message types.
//!
//! A node opens one streaming subscription per peer. The request names the
//! originators it wants and the vector clock it already holds; the peer
//! answers with an open-ended stream of envelope batches.

use serde::{Deserialize, Serialize};

use meshlog_core::{Cursor, NodeId, RawOriginatorEnvelope, VectorClock};

/// Which envelopes to stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopesQuery {
    pub originator_node_ids: Vec<u32>,
    /// Stream only envelopes above these per-originator sequence ids.
    pub last_seen: Cursor,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeEnvelopesRequest {
    pub query: EnvelopesQuery,
}

impl SubscribeEnvelopesRequest {
    pub fn new(originators: &[NodeId], last_seen: &VectorClock) -> Self {
        Self {
            query: EnvelopesQuery {
                originator_node_ids: originators.iter().map(|id| id.get()).collect(),
                last_seen: last_seen.to_cursor(),
            },
        }
    }

    pub fn originators(&self) -> Vec<NodeId> {
        self.query
            .originator_node_ids
            .iter()
            .copied()
            .map(NodeId)
            .collect()
    }

    pub fn last_seen(&self) -> VectorClock {
        VectorClock::from(&self.query.last_seen)
    }
}

/// One batch of envelopes pushed by the peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeEnvelopesResponse {
    pub envelopes: Vec<RawOriginatorEnvelope>,
}

impl From<Vec<RawOriginatorEnvelope>> for SubscribeEnvelopesResponse {
    fn from(envelopes: Vec<RawOriginatorEnvelope>) -> Self {
        Self { envelopes }
    }
}
