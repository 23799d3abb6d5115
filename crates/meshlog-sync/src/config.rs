//! Replication configuration.

use std::time::Duration;

use meshlog_core::NodeId;

/// Synthetic originator ids used for data migrated from the legacy network.
pub mod migration_originators {
    use meshlog_core::NodeId;

    pub const GROUP_MESSAGES: NodeId = NodeId(10);
    pub const WELCOME_MESSAGES: NodeId = NodeId(11);
    pub const INBOX_LOG: NodeId = NodeId(12);
    pub const KEY_PACKAGES: NodeId = NodeId(13);
    pub const COMMIT_MESSAGES: NodeId = NodeId(14);

    /// Migration originators requested from the migration source node.
    ///
    /// Inbox log and commit messages are published on-chain, not replicated.
    pub const REPLICATED: [NodeId; 3] = [GROUP_MESSAGES, WELCOME_MESSAGES, KEY_PACKAGES];
}

/// Exponential backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    /// Each delay is jittered by up to this fraction either way.
    pub randomization_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            multiplier: 1.5,
            randomization_factor: 0.5,
        }
    }
}

/// Pulling from a designated migration source node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationConfig {
    pub enable: bool,
    pub from_node_id: NodeId,
}

/// Configuration for the sync worker and its per-peer tasks.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Capacity of each peer's stream → sink queue.
    pub write_queue_capacity: usize,
    /// Reconnect schedule for failed subscriptions.
    pub stream_backoff: BackoffConfig,
    /// Retry schedule for failed envelope writes.
    pub sink_backoff: BackoffConfig,
    /// Delay before resubscribing after a clean end of stream.
    pub eof_retry_delay: Duration,
    /// Delay before resubscribing to a peer running an incompatible version.
    pub incompatible_retry_delay: Duration,
    /// Lifetime of auth tokens issued to peers.
    pub auth_token_ttl: Duration,
    pub migration: MigrationConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            write_queue_capacity: 10,
            stream_backoff: BackoffConfig::default(),
            sink_backoff: BackoffConfig {
                initial_interval: Duration::from_millis(100),
                max_interval: Duration::from_secs(5),
                ..BackoffConfig::default()
            },
            eof_retry_delay: Duration::from_secs(1),
            incompatible_retry_delay: Duration::from_secs(60 * 60),
            auth_token_ttl: Duration::from_secs(60 * 60),
            migration: MigrationConfig::default(),
        }
    }
}
