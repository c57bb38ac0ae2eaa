//! SQLite-backed persistence.

use std::path::Path;

use async_trait::async_trait;
use herald_core::types::Timestamp;
use rusqlite::{params, OptionalExtension};

use crate::db::Database;
use crate::error::StorageError;
use crate::persistence::{HistoryRecord, Persistence};

/// [`Persistence`] over a single WAL-mode SQLite file.
///
/// Every statement runs through [`Database::run`] on the blocking pool.
#[derive(Debug)]
pub struct SqliteStore {
    db: Database,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        Ok(Self {
            db: Database::new(path)?,
        })
    }

    pub fn in_memory() -> Result<Self, StorageError> {
        Ok(Self {
            db: Database::in_memory()?,
        })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

#[async_trait]
impl Persistence for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError> {
        let key = key.to_string();
        let raw: Option<String> = self
            .db
            .run(move |conn| {
                Ok(conn
                    .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                        row.get(0)
                    })
                    .optional()?)
            })
            .await?;
        raw.map(|s| serde_json::from_str(&s).map_err(StorageError::from))
            .transpose()
    }

    async fn set(&self, key: &str, value: serde_json::Value) -> Result<(), StorageError> {
        let encoded = serde_json::to_string(&value)?;
        let now = Timestamp::now().0;
        let key = key.to_string();
        self.db
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                                    updated_at = excluded.updated_at",
                    params![key, encoded, now],
                )?;
                Ok(())
            })
            .await
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let key = key.to_string();
        self.db
            .run(move |conn| {
                let removed = conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
                Ok(removed > 0)
            })
            .await
    }

    async fn scan_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, serde_json::Value)>, StorageError> {
        let prefix = prefix.to_string();
        let rows: Vec<(String, String)> = self
            .db
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT key, value FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
                )?;
                let rows = stmt
                    .query_map(params![prefix], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter()
            .map(|(k, v)| -> Result<_, StorageError> { Ok((k, serde_json::from_str(&v)?)) })
            .collect()
    }

    async fn append_history(
        &self,
        context_id: &str,
        record: HistoryRecord,
    ) -> Result<(), StorageError> {
        let data = serde_json::to_string(&record.data)?;
        let context_id = context_id.to_string();
        self.db
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO history (context_id, kind, text, data, recorded_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![context_id, record.kind, record.text, data, record.recorded_at.0],
                )?;
                Ok(())
            })
            .await
    }

    async fn query_recent(
        &self,
        context_id: &str,
        limit: usize,
    ) -> Result<Vec<HistoryRecord>, StorageError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let context_id = context_id.to_string();
        let rows: Vec<(String, String, String, i64)> = self
            .db
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT kind, text, data, recorded_at FROM history
                     WHERE context_id = ?1 ORDER BY id DESC LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(params![context_id, limit], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut records = rows
            .into_iter()
            .map(|(kind, text, data, recorded_at)| -> Result<_, StorageError> {
                Ok(HistoryRecord {
                    kind,
                    text,
                    data: serde_json::from_str(&data)?,
                    recorded_at: Timestamp(recorded_at),
                })
            })
            .collect::<Result<Vec<_>, StorageError>>()?;
        records.reverse();
        Ok(records)
    }
}
