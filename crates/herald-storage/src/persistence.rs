//! The persistence collaborator contract.

use async_trait::async_trait;
use herald_core::types::Timestamp;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// One entry in a conversation's interaction history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Who or what produced the entry, e.g. "user", "intent", "system".
    pub kind: String,
    pub text: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub recorded_at: Timestamp,
}

impl HistoryRecord {
    pub fn new(kind: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            text: text.into(),
            data: serde_json::Value::Null,
            recorded_at: Timestamp::now(),
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// Key/value and history storage used by the learning engine and router.
///
/// Implementations may fail transiently; callers treat every method as
/// best-effort and never block routing on it.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError>;

    async fn set(&self, key: &str, value: serde_json::Value) -> Result<(), StorageError>;

    /// Returns true if the key existed.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// All entries whose key starts with `prefix`, ordered by key.
    async fn scan_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, serde_json::Value)>, StorageError>;

    async fn append_history(
        &self,
        context_id: &str,
        record: HistoryRecord,
    ) -> Result<(), StorageError>;

    /// The last `limit` records for a context, oldest first.
    async fn query_recent(
        &self,
        context_id: &str,
        limit: usize,
    ) -> Result<Vec<HistoryRecord>, StorageError>;
}
