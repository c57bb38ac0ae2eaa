//! In-memory persistence, used in tests and with `--in-memory`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::persistence::{HistoryRecord, Persistence};

const DEFAULT_HISTORY_PER_CONTEXT: usize = 1000;

/// HashMap-backed store; history is bounded per context.
pub struct MemoryStore {
    kv: Mutex<BTreeMap<String, serde_json::Value>>,
    history: Mutex<HashMap<String, VecDeque<HistoryRecord>>>,
    history_limit: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_PER_CONTEXT)
    }

    pub fn with_history_limit(history_limit: usize) -> Self {
        Self {
            kv: Mutex::new(BTreeMap::new()),
            history: Mutex::new(HashMap::new()),
            history_limit: history_limit.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.kv.lock().map(|kv| kv.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn kv(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, serde_json::Value>>, StorageError> {
        self.kv
            .lock()
            .map_err(|e| StorageError::Unavailable(format!("store lock poisoned: {}", e)))
    }

    fn history(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, VecDeque<HistoryRecord>>>, StorageError>
    {
        self.history
            .lock()
            .map_err(|e| StorageError::Unavailable(format!("history lock poisoned: {}", e)))
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError> {
        Ok(self.kv()?.get(key).cloned())
    }

    async fn set(&self, key: &str, value: serde_json::Value) -> Result<(), StorageError> {
        self.kv()?.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.kv()?.remove(key).is_some())
    }

    async fn scan_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, serde_json::Value)>, StorageError> {
        Ok(self
            .kv()?
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn append_history(
        &self,
        context_id: &str,
        record: HistoryRecord,
    ) -> Result<(), StorageError> {
        let mut history = self.history()?;
        let entries = history.entry(context_id.to_string()).or_default();
        entries.push_back(record);
        while entries.len() > self.history_limit {
            entries.pop_front();
        }
        Ok(())
    }

    async fn query_recent(
        &self,
        context_id: &str,
        limit: usize,
    ) -> Result<Vec<HistoryRecord>, StorageError> {
        let history = self.history()?;
        Ok(history
            .get(context_id)
            .map(|entries| {
                let skip = entries.len().saturating_sub(limit);
                entries.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_get_set_delete() {
        let store = MemoryStore::new();
        assert!(store.get("missing").await.unwrap().is_none());
        store.set("a", json!({"x": 1})).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(json!({"x": 1})));
        assert!(store.delete("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_scan_prefix() {
        let store = MemoryStore::new();
        store.set("profile:bob", json!(1)).await.unwrap();
        store.set("profile:alice", json!(2)).await.unwrap();
        store.set("other:carol", json!(3)).await.unwrap();
        let found = store.scan_prefix("profile:").await.unwrap();
        let keys: Vec<_> = found.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["profile:alice", "profile:bob"]);
    }

    #[tokio::test]
    async fn test_query_recent_returns_tail_oldest_first() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store
                .append_history("ctx", HistoryRecord::new("user", format!("turn {}", i)))
                .await
                .unwrap();
        }
        let recent = store.query_recent("ctx", 3).await.unwrap();
        let texts: Vec<_> = recent.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, vec!["turn 2", "turn 3", "turn 4"]);
        assert!(store.query_recent("other", 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_history_is_bounded_per_context() {
        let store = MemoryStore::with_history_limit(2);
        for i in 0..4 {
            store
                .append_history("ctx", HistoryRecord::new("user", i.to_string()))
                .await
                .unwrap();
        }
        let all = store.query_recent("ctx", 10).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].text, "2");
    }
}
