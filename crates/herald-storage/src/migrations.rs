//! Database schema migrations.
//!
//! Tracks applied versions in `schema_migrations`; each version is applied
//! at most once.

use rusqlite::Connection;
use tracing::info;

use crate::error::StorageError;

/// Run all pending database migrations.
pub fn run_migrations(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| StorageError::Database(format!("Failed to create migrations table: {}", e)))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| {
            StorageError::Database(format!("Failed to query migration version: {}", e))
        })?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: kv_and_history");
    }

    Ok(())
}

/// Version 1: key/value table and per-context interaction history.
fn apply_v1(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS kv (
            key         TEXT PRIMARY KEY NOT NULL,
            value       TEXT NOT NULL,
            updated_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );

        CREATE TABLE IF NOT EXISTS history (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            context_id  TEXT NOT NULL,
            kind        TEXT NOT NULL,
            text        TEXT NOT NULL DEFAULT '',
            data        TEXT NOT NULL DEFAULT 'null',
            recorded_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_history_context
            ON history (context_id, id DESC);

        INSERT OR IGNORE INTO schema_migrations (version, name) VALUES (1, 'kv_and_history');
        ",
    )
    .map_err(|e| StorageError::Database(format!("Migration v1 failed: {}", e)))
}
