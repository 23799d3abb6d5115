//! SQLite implementation of the Store trait.
//!
//! Uses rusqlite with bundled SQLite. Every statement runs on the blocking
//! pool via `tokio::task::spawn_blocking` so the async runtime never waits
//! on disk.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use rusqlite::{params, Connection, OptionalExtension, Row, RowIndex};

use meshlog_core::{Address, NodeId, PayerId, PicoDollar};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::{GatewayEnvelope, Store, UnsettledUsage, UsageIncrement, VectorClockEntry};

/// SQLite-based store implementation.
///
/// Thread-safe via an internal Mutex around a single connection.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path, creating and migrating it if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|e| {
                StoreError::Database(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
                    Some(format!("mutex poisoned: {}", e)),
                ))
            })?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::TaskFailed(format!("spawn_blocking failed: {}", e)))?
    }
}

/// SQLite integers are signed; values above `i64::MAX` are rejected rather
/// than wrapped.
fn to_signed(value: u64, column: &str) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| StoreError::InvalidData(format!("{column} {value} out of range")))
}

fn get_unsigned<I: RowIndex>(row: &Row<'_>, idx: I) -> rusqlite::Result<u64> {
    let idx = idx.idx(row.as_ref())?;
    let value: i64 = row.get(idx)?;
    u64::try_from(value).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, value))
}

fn insert_envelope_row(conn: &Connection, envelope: &GatewayEnvelope) -> Result<u64> {
    let sequence_id = to_signed(envelope.originator_sequence_id, "originator_sequence_id")?;
    let expiry = to_signed(envelope.expiry_unixtime, "expiry")?;
    let inserted = conn.execute(
        "INSERT INTO gateway_envelopes (
            originator_node_id, originator_sequence_id, topic, payer_id,
            gateway_time, expiry, originator_envelope
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT DO NOTHING",
        params![
            envelope.originator_node_id.get(),
            sequence_id,
            envelope.topic,
            envelope.payer_id.map(|p| p.0),
            envelope.gateway_time_ns,
            expiry,
            envelope.originator_envelope.as_ref(),
        ],
    )?;
    Ok(inserted as u64)
}

fn row_to_envelope(row: &rusqlite::Row<'_>) -> rusqlite::Result<GatewayEnvelope> {
    let payload: Vec<u8> = row.get("originator_envelope")?;
    Ok(GatewayEnvelope {
        originator_node_id: NodeId(row.get("originator_node_id")?),
        originator_sequence_id: get_unsigned(row, "originator_sequence_id")?,
        topic: row.get("topic")?,
        payer_id: row.get::<_, Option<i64>>("payer_id")?.map(PayerId),
        gateway_time_ns: row.get("gateway_time")?,
        expiry_unixtime: get_unsigned(row, "expiry")?,
        originator_envelope: Bytes::from(payload),
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_gateway_envelope_and_increment_unsettled_usage(
        &self,
        envelope: GatewayEnvelope,
        usage: UsageIncrement,
    ) -> Result<u64> {
        self.run(move |conn| {
            let spend = to_signed(usage.spend.get(), "spend_picodollars")?;
            let sequence_id = to_signed(usage.sequence_id, "last_sequence_id")?;
            let tx = conn.transaction()?;

            let inserted = insert_envelope_row(&tx, &envelope)?;
            if inserted == 0 {
                return Ok(0);
            }

            tx.execute(
                "INSERT INTO unsettled_usage (
                    payer_id, originator_id, minutes_since_epoch,
                    spend_picodollars, last_sequence_id, message_count
                 ) VALUES (?1, ?2, ?3, ?4, ?5, 1)
                 ON CONFLICT (payer_id, originator_id, minutes_since_epoch) DO UPDATE SET
                    spend_picodollars = spend_picodollars + excluded.spend_picodollars,
                    last_sequence_id = MAX(last_sequence_id, excluded.last_sequence_id),
                    message_count = message_count + 1",
                params![
                    usage.payer_id.0,
                    usage.originator_id.get(),
                    usage.minutes_since_epoch,
                    spend,
                    sequence_id,
                ],
            )?;

            tx.execute(
                "INSERT INTO originator_congestion (originator_id, minutes_since_epoch, num_messages)
                 VALUES (?1, ?2, 1)
                 ON CONFLICT (originator_id, minutes_since_epoch) DO UPDATE SET
                    num_messages = num_messages + 1",
                params![usage.originator_id.get(), usage.minutes_since_epoch],
            )?;

            tx.commit()?;
            Ok(inserted)
        })
        .await
    }

    async fn insert_gateway_envelope(&self, envelope: GatewayEnvelope) -> Result<u64> {
        self.run(move |conn| insert_envelope_row(conn, &envelope)).await
    }

    async fn gateway_envelopes_by_originator(
        &self,
        originator: NodeId,
    ) -> Result<Vec<GatewayEnvelope>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM gateway_envelopes
                 WHERE originator_node_id = ?1
                 ORDER BY originator_sequence_id",
            )?;
            let rows = stmt
                .query_map(params![originator.get()], row_to_envelope)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn select_vector_clock(&self) -> Result<Vec<VectorClockEntry>> {
        self.run(|conn| {
            let mut stmt = conn.prepare(
                "SELECT g.originator_node_id, g.originator_sequence_id, g.gateway_time
                 FROM gateway_envelopes g
                 JOIN (
                    SELECT originator_node_id, MAX(originator_sequence_id) AS max_seq
                    FROM gateway_envelopes
                    GROUP BY originator_node_id
                 ) m
                 ON g.originator_node_id = m.originator_node_id
                    AND g.originator_sequence_id = m.max_seq
                 ORDER BY g.originator_node_id",
            )?;
            let entries = stmt
                .query_map([], |row| {
                    Ok(VectorClockEntry {
                        originator_node_id: NodeId(row.get(0)?),
                        originator_sequence_id: get_unsigned(row, 1)?,
                        gateway_time_ns: row.get(2)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
        .await
    }

    async fn find_or_create_payer(&self, address: &Address) -> Result<PayerId> {
        let address = address.to_hex();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO payers (address) VALUES (?1) ON CONFLICT (address) DO NOTHING",
                params![address],
            )?;
            let id: i64 = conn.query_row(
                "SELECT id FROM payers WHERE address = ?1",
                params![address],
                |row| row.get(0),
            )?;
            Ok(PayerId(id))
        })
        .await
    }

    async fn unsettled_usage(
        &self,
        payer_id: PayerId,
        originator: NodeId,
        minutes_since_epoch: i64,
    ) -> Result<Option<UnsettledUsage>> {
        self.run(move |conn| {
            let usage = conn
                .query_row(
                    "SELECT spend_picodollars, last_sequence_id, message_count
                     FROM unsettled_usage
                     WHERE payer_id = ?1 AND originator_id = ?2 AND minutes_since_epoch = ?3",
                    params![payer_id.0, originator.get(), minutes_since_epoch],
                    |row| {
                        Ok(UnsettledUsage {
                            payer_id,
                            originator_id: originator,
                            minutes_since_epoch,
                            spend: PicoDollar(get_unsigned(row, 0)?),
                            last_sequence_id: get_unsigned(row, 1)?,
                            message_count: get_unsigned(row, 2)?,
                        })
                    },
                )
                .optional()?;
            Ok(usage)
        })
        .await
    }

    async fn originator_congestion(
        &self,
        originator: NodeId,
        minutes_since_epoch: i64,
    ) -> Result<u64> {
        self.run(move |conn| {
            let count: Option<i64> = conn
                .query_row(
                    "SELECT num_messages FROM originator_congestion
                     WHERE originator_id = ?1 AND minutes_since_epoch = ?2",
                    params![originator.get(), minutes_since_epoch],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(count.map_or(0, |n| u64::try_from(n).unwrap_or(0)))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::StoreExt;

    fn envelope(originator: u32, seq: u64, payer: Option<PayerId>) -> GatewayEnvelope {
        GatewayEnvelope {
            originator_node_id: NodeId(originator),
            originator_sequence_id: seq,
            topic: vec![0, 1, 2],
            payer_id: payer,
            gateway_time_ns: 60_000_000_000 * 5 + (seq % 1_000) as i64,
            expiry_unixtime: 0,
            originator_envelope: Bytes::from(vec![seq as u8; 8]),
        }
    }

    fn usage(payer: PayerId, originator: u32, seq: u64) -> UsageIncrement {
        UsageIncrement {
            payer_id: payer,
            originator_id: NodeId(originator),
            minutes_since_epoch: 5,
            spend: PicoDollar(100),
            sequence_id: seq,
        }
    }

    #[tokio::test]
    async fn test_insert_is_idempotent() {
        let store = SqliteStore::open_memory().unwrap();
        let payer = store.find_or_create_payer(&Address([7; 20])).await.unwrap();

        let first = store
            .insert_gateway_envelope_and_increment_unsettled_usage(
                envelope(200, 1, Some(payer)),
                usage(payer, 200, 1),
            )
            .await
            .unwrap();
        let second = store
            .insert_gateway_envelope_and_increment_unsettled_usage(
                envelope(200, 1, Some(payer)),
                usage(payer, 200, 1),
            )
            .await
            .unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 0);

        let rows = store.gateway_envelopes_by_originator(NodeId(200)).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].originator_sequence_id, 1);

        // usage counted once
        let usage = store.unsettled_usage(payer, NodeId(200), 5).await.unwrap().unwrap();
        assert_eq!(usage.message_count, 1);
        assert_eq!(usage.spend, PicoDollar(100));
        assert_eq!(store.originator_congestion(NodeId(200), 5).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_usage_accumulates_per_minute() {
        let store = SqliteStore::open_memory().unwrap();
        let payer = store.find_or_create_payer(&Address([1; 20])).await.unwrap();

        for seq in [1, 3, 2] {
            store
                .insert_gateway_envelope_and_increment_unsettled_usage(
                    envelope(100, seq, Some(payer)),
                    usage(payer, 100, seq),
                )
                .await
                .unwrap();
        }

        let usage = store.unsettled_usage(payer, NodeId(100), 5).await.unwrap().unwrap();
        assert_eq!(usage.message_count, 3);
        assert_eq!(usage.spend, PicoDollar(300));
        assert_eq!(usage.last_sequence_id, 3);
        assert!(store.unsettled_usage(payer, NodeId(100), 6).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_or_create_payer_is_stable() {
        let store = SqliteStore::open_memory().unwrap();
        let a = store.find_or_create_payer(&Address([1; 20])).await.unwrap();
        let b = store.find_or_create_payer(&Address([2; 20])).await.unwrap();
        let a_again = store.find_or_create_payer(&Address([1; 20])).await.unwrap();

        assert_eq!(a, a_again);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_vector_clock_tracks_max_per_originator() {
        let store = SqliteStore::open_memory().unwrap();
        for (originator, seq) in [(100, 1), (100, 4), (100, 2), (200, 9)] {
            store
                .insert_gateway_envelope(envelope(originator, seq, None))
                .await
                .unwrap();
        }

        let entries = store.select_vector_clock().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].originator_node_id, NodeId(100));
        assert_eq!(entries[0].originator_sequence_id, 4);
        assert_eq!(entries[0].gateway_time_ns, 60_000_000_000 * 5 + 4);

        let clock = store.vector_clock().await.unwrap();
        assert_eq!(clock.get(NodeId(200)), 9);
        assert_eq!(clock.get(NodeId(300)), 0);
    }

    #[tokio::test]
    async fn test_out_of_range_values_are_rejected() {
        let store = SqliteStore::open_memory().unwrap();
        let payer = store.find_or_create_payer(&Address([3; 20])).await.unwrap();
        store.insert_gateway_envelope(envelope(100, 5, None)).await.unwrap();

        let too_big = i64::MAX as u64 + 2;
        let err = store
            .insert_gateway_envelope(envelope(100, too_big, None))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidData(_)));

        let mut saturated = usage(payer, 100, 6);
        saturated.spend = PicoDollar(u64::MAX);
        let err = store
            .insert_gateway_envelope_and_increment_unsettled_usage(
                envelope(100, 6, Some(payer)),
                saturated,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidData(_)));

        // Nothing from the rejected writes is visible.
        let clock = store.vector_clock().await.unwrap();
        assert_eq!(clock.get(NodeId(100)), 5);
        assert!(store.unsettled_usage(payer, NodeId(100), 5).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_largest_storable_sequence_id_round_trips() {
        let store = SqliteStore::open_memory().unwrap();
        let max = i64::MAX as u64;
        store.insert_gateway_envelope(envelope(100, 5, None)).await.unwrap();
        store.insert_gateway_envelope(envelope(100, max, None)).await.unwrap();

        let entries = store.select_vector_clock().await.unwrap();
        assert_eq!(entries[0].originator_sequence_id, max);
        let rows = store.gateway_envelopes_by_originator(NodeId(100)).await.unwrap();
        assert_eq!(rows.last().unwrap().originator_sequence_id, max);
    }

    #[tokio::test]
    async fn test_reopen_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meshlog.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.insert_gateway_envelope(envelope(100, 1, None)).await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let clock = store.vector_clock().await.unwrap();
        assert_eq!(clock.get(NodeId(100)), 1);
    }
}
