//! Per-peer subscription stream.
//!
//! [`OriginatorStream`] is the trust boundary of replication: every envelope
//! a peer sends is decoded, checked against the originators that peer may
//! speak for, tracked against a per-originator cursor and checked for a
//! recoverable payer signature before it reaches the write queue.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use meshlog_core::{NodeId, OriginatorCursor, OriginatorEnvelope, RawOriginatorEnvelope};

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::messages::SubscribeEnvelopesResponse;
use crate::transport::{EnvelopeStream, StreamError};

/// Why [`OriginatorStream::listen`] returned.
#[derive(Debug)]
pub enum StreamExit {
    /// The stream's token was cancelled. Do not retry.
    Cancelled,
    /// Resubscribe after this delay, resetting nothing else.
    RetryAfter(Duration),
    /// Resubscribe on the regular backoff schedule.
    Failed(SyncError),
}

/// Counters for one stream.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StreamStats {
    pub received: u64,
    pub accepted: u64,
    pub dropped: u64,
    pub out_of_order: u64,
}

/// Reads one subscription and feeds validated envelopes to the sink.
pub struct OriginatorStream {
    peer: NodeId,
    stream: Option<Box<dyn EnvelopeStream>>,
    cursors: HashMap<NodeId, OriginatorCursor>,
    permitted: BTreeSet<NodeId>,
    write_queue: mpsc::Sender<OriginatorEnvelope>,
    token: CancellationToken,
    eof_retry_delay: Duration,
    incompatible_retry_delay: Duration,
    stats: StreamStats,
}

impl OriginatorStream {
    /// `last_seen` seeds the cursors; `permitted` is every originator this
    /// peer may send envelopes for.
    pub fn new(
        peer: NodeId,
        stream: Box<dyn EnvelopeStream>,
        last_seen: HashMap<NodeId, OriginatorCursor>,
        permitted: impl IntoIterator<Item = NodeId>,
        write_queue: mpsc::Sender<OriginatorEnvelope>,
        token: CancellationToken,
    ) -> Self {
        let defaults = SyncConfig::default();
        Self {
            peer,
            stream: Some(stream),
            cursors: last_seen,
            permitted: permitted.into_iter().collect(),
            write_queue,
            token,
            eof_retry_delay: defaults.eof_retry_delay,
            incompatible_retry_delay: defaults.incompatible_retry_delay,
            stats: StreamStats::default(),
        }
    }

    pub fn with_retry_delays(mut self, eof: Duration, incompatible: Duration) -> Self {
        self.eof_retry_delay = eof;
        self.incompatible_retry_delay = incompatible;
        self
    }

    pub fn peer(&self) -> NodeId {
        self.peer
    }

    /// Last accepted position for `originator`, if any.
    pub fn cursor(&self, originator: NodeId) -> Option<OriginatorCursor> {
        self.cursors.get(&originator).copied()
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    /// Consume the stream until it ends, fails or is cancelled.
    ///
    /// Pushing to the write queue waits for the sink, so a slow sink slows
    /// down reads from the peer.
    pub async fn listen(&mut self) -> StreamExit {
        let Some(mut stream) = self.stream.take() else {
            return StreamExit::Failed(SyncError::Transport("stream already consumed".into()));
        };

        let (batch_tx, mut batch_rx) = mpsc::channel::<SubscribeEnvelopesResponse>(1);
        let (err_tx, mut err_rx) = oneshot::channel::<StreamError>();
        let _reader = ReaderGuard(tokio::spawn(async move {
            loop {
                match stream.recv().await {
                    Ok(batch) => {
                        if batch_tx.send(batch).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = err_tx.send(e);
                        return;
                    }
                }
            }
        }));

        loop {
            // Batches go before the error so nothing read ahead of it is lost.
            tokio::select! {
                biased;

                _ = self.token.cancelled() => {
                    info!(peer = %self.peer, "context cancelled, stopping stream listener");
                    return StreamExit::Cancelled;
                }

                Some(batch) = batch_rx.recv() => {
                    if let Some(exit) = self.handle_batch(batch).await {
                        return exit;
                    }
                }

                err = &mut err_rx => {
                    return match err {
                        Ok(e) => self.classify_stream_error(e),
                        Err(_) => StreamExit::Failed(SyncError::Transport(
                            "stream reader stopped".into(),
                        )),
                    };
                }
            }
        }
    }

    async fn handle_batch(&mut self, batch: SubscribeEnvelopesResponse) -> Option<StreamExit> {
        if batch.envelopes.is_empty() {
            return None;
        }
        debug!(peer = %self.peer, num_envelopes = batch.envelopes.len(), "received envelopes");

        for raw in batch.envelopes {
            self.stats.received += 1;
            let envelope = match self.validate_envelope(raw) {
                Ok(envelope) => envelope,
                Err(e @ SyncError::OriginatorNotPermitted { .. }) => {
                    self.stats.dropped += 1;
                    warn!(
                        peer = %self.peer,
                        permitted = ?self.permitted,
                        error = %e,
                        "received envelope from invalid originator"
                    );
                    return Some(StreamExit::Failed(e));
                }
                Err(e) => {
                    self.stats.dropped += 1;
                    warn!(peer = %self.peer, error = %e, "discarding envelope after validation failed");
                    continue;
                }
            };
            self.stats.accepted += 1;

            tokio::select! {
                biased;

                _ = self.token.cancelled() => return Some(StreamExit::Cancelled),
                sent = self.write_queue.send(envelope) => {
                    if sent.is_err() {
                        return Some(StreamExit::Failed(SyncError::QueueClosed));
                    }
                }
            }
        }
        None
    }

    fn classify_stream_error(&self, error: StreamError) -> StreamExit {
        if error == StreamError::Eof {
            info!(peer = %self.peer, "stream closed with EOF");
            return StreamExit::RetryAfter(self.eof_retry_delay);
        }
        warn!(peer = %self.peer, error = %error, "stream closed with error");
        if error.is_incompatible() {
            // The peer rejects our version; its config may change later.
            return StreamExit::RetryAfter(self.incompatible_retry_delay);
        }
        StreamExit::Failed(error.into())
    }

    /// Static validation of one envelope. Any error drops the envelope for
    /// good; only a non-permitted originator also ends the stream.
    pub fn validate_envelope(&mut self, raw: RawOriginatorEnvelope) -> Result<OriginatorEnvelope> {
        let envelope = OriginatorEnvelope::from_raw(raw)?;

        let originator = envelope.originator_node_id();
        if !self.permitted.contains(&originator) {
            return Err(SyncError::OriginatorNotPermitted {
                originator,
                peer: self.peer,
            });
        }

        let sequence_id = envelope.sequence_id();
        let timestamp_ns = envelope.originator_ns();
        let last = self.cursors.get(&originator).copied().unwrap_or_default();

        let in_sequence = last.sequence_id.checked_add(1) == Some(sequence_id);
        if !in_sequence || timestamp_ns < last.timestamp_ns {
            self.stats.out_of_order += 1;
            warn!(
                peer = %self.peer,
                originator_id = %originator,
                sequence_id,
                expected_sequence_id = last.sequence_id.saturating_add(1),
                last_timestamp_ns = last.timestamp_ns,
                timestamp_ns,
                "received out-of-order envelope"
            );
        }

        if sequence_id > last.sequence_id {
            self.cursors.insert(
                originator,
                OriginatorCursor {
                    sequence_id,
                    timestamp_ns,
                },
            );
        }

        envelope.payer_envelope().recover_signer()?;
        Ok(envelope)
    }
}

/// Aborts the reader task when the listener goes away.
struct ReaderGuard(JoinHandle<()>);

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}
