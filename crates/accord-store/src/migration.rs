//! Database schema migrations for SQLite.
//!
//! A simple versioned migration system. Each migration is a SQL batch that
//! transforms the schema from version N to N+1.

use rusqlite::Connection;

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 1;

/// Initialize or migrate the database schema.
///
/// This function is idempotent - it can be called multiple times safely.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current < CURRENT_VERSION {
        tracing::info!(from = current, to = CURRENT_VERSION, "migrating schema");
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_millis()],
            )?;
        }

        tx.commit()?;
    }

    Ok(())
}

/// Apply a specific migration version.
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
        -- Fingerprint tables: one logical table per (member, category)
        CREATE TABLE hashes (
            member INTEGER NOT NULL,
            category TEXT NOT NULL,
            unique_id TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            PRIMARY KEY (member, category, unique_id)
        );

        -- Anchor tokens: data-store identity per (member, category)
        CREATE TABLE anchors (
            member INTEGER NOT NULL,
            category TEXT NOT NULL,
            token TEXT NOT NULL,
            updated_at INTEGER NOT NULL,      -- Unix ms of the finalize that wrote it
            PRIMARY KEY (member, category)
        );

        -- Append-only payload archive for crash recovery.
        -- AUTOINCREMENT keeps ids monotonic; dropped ids are never reused.
        CREATE TABLE archive (
            archive_id INTEGER PRIMARY KEY AUTOINCREMENT,
            body BLOB NOT NULL,               -- CBOR ArchivedChange envelope
            stored_at INTEGER NOT NULL
        );

        -- Identity mappings: one row per (mapping, member) entry.
        -- The UNIQUE constraint backs the identity-uniqueness invariant
        -- at the storage layer.
        CREATE TABLE mappings (
            mapping_id INTEGER NOT NULL,
            member INTEGER NOT NULL,
            category TEXT NOT NULL,
            unique_id TEXT NOT NULL,
            kind INTEGER NOT NULL,            -- ChangeKind as u16
            dirty INTEGER NOT NULL DEFAULT 0,
            archive_id INTEGER,               -- set while a propagation is in flight
            PRIMARY KEY (mapping_id, member),
            UNIQUE (member, category, unique_id)
        );

        -- Indexes for common queries
        CREATE INDEX idx_mappings_member ON mappings(member, category);
        CREATE INDEX idx_mappings_dirty ON mappings(dirty);
        "#,
    )?;

    Ok(())
}

/// Get current time in milliseconds.
fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time went backwards")
        .as_millis() as i64
}
