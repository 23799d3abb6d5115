//! Database schema migrations for SQLite.
//!
//! Simple versioned migrations: each version is a SQL batch that moves the
//! schema from N-1 to N.

use rusqlite::Connection;

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 1;

/// Initialize or migrate the database schema.
///
/// Idempotent; safe to call on every open.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_millis()],
            )?;
        }

        tx.commit()?;
        tracing::debug!(from = current, to = CURRENT_VERSION, "schema migrated");
    }

    Ok(())
}

fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Payers, identified by recovered address
        CREATE TABLE payers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            address TEXT NOT NULL UNIQUE          -- 0x-prefixed lowercase hex
        );

        -- Replicated envelopes, one row per originator identity
        CREATE TABLE gateway_envelopes (
            originator_node_id INTEGER NOT NULL,
            originator_sequence_id INTEGER NOT NULL,
            topic BLOB NOT NULL,
            payer_id INTEGER REFERENCES payers(id),
            gateway_time INTEGER NOT NULL,        -- originator receive time (unix ns)
            expiry INTEGER NOT NULL DEFAULT 0,    -- unix seconds, 0 = never
            originator_envelope BLOB NOT NULL,

            PRIMARY KEY (originator_node_id, originator_sequence_id)
        );

        -- Unbilled spend per payer, originator and minute
        CREATE TABLE unsettled_usage (
            payer_id INTEGER NOT NULL REFERENCES payers(id),
            originator_id INTEGER NOT NULL,
            minutes_since_epoch INTEGER NOT NULL,
            spend_picodollars INTEGER NOT NULL DEFAULT 0,
            last_sequence_id INTEGER NOT NULL DEFAULT 0,
            message_count INTEGER NOT NULL DEFAULT 0,

            PRIMARY KEY (payer_id, originator_id, minutes_since_epoch)
        );

        -- Messages per originator and minute, read by the congestion fee
        CREATE TABLE originator_congestion (
            originator_id INTEGER NOT NULL,
            minutes_since_epoch INTEGER NOT NULL,
            num_messages INTEGER NOT NULL DEFAULT 0,

            PRIMARY KEY (originator_id, minutes_since_epoch)
        );

        CREATE INDEX idx_gateway_envelopes_topic ON gateway_envelopes(topic);
        CREATE INDEX idx_gateway_envelopes_expiry ON gateway_envelopes(expiry);
        "#,
    )?;

    Ok(())
}

fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_creates_tables() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        for table in [
            "payers",
            "gateway_envelopes",
            "unsettled_usage",
            "originator_congestion",
            "schema_migrations",
        ] {
            assert!(tables.contains(&table.to_string()), "missing table {}", table);
        }
    }

    #[test]
    fn test_migration_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();

        let version: u32 = conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }
}
