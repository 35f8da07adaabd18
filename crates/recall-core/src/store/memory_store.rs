//! In-memory state store
//!
//! # Security Warning
//!
//! Not suitable for production: everything is lost on restart and nothing is
//! shared between processes. [`StoreBackend::from_config`](super::StoreBackend::from_config)
//! refuses it when `RECALL_ENV=production`.

use super::{Fields, Session, StateRecord, StateStore, StoreError, StoreResult, Version};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Default)]
struct Inner {
    records: HashMap<String, StateRecord>,
    /// Last version of each deleted record
    tombstones: HashMap<String, Version>,
    sessions: HashMap<String, Session>,
}

/// In-memory state store (for development/testing)
///
/// The compare-and-swap runs entirely under the write lock, so it has the
/// same atomicity as the durable backends.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub async fn count(&self) -> usize {
        self.inner.read().await.records.len()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, session_id: &str) -> StoreResult<Option<StateRecord>> {
        let inner = self.inner.read().await;
        Ok(inner.records.get(session_id).cloned())
    }

    async fn put(
        &self,
        session_id: &str,
        fields: &Fields,
        expected_version: Version,
    ) -> StoreResult<Version> {
        let mut inner = self.inner.write().await;
        let live = inner.records.get(session_id).map(|r| r.version);
        let accepted = match live {
            Some(version) => version == expected_version,
            None => expected_version == 0,
        };
        if !accepted {
            let actual = live
                .or_else(|| inner.tombstones.get(session_id).copied())
                .unwrap_or(0);
            return Err(StoreError::VersionConflict {
                session_id: session_id.to_string(),
                expected: expected_version,
                actual,
            });
        }

        let now = Utc::now();
        let base = match live {
            Some(version) => version,
            None => inner.tombstones.remove(session_id).unwrap_or(0),
        };
        let record = inner
            .records
            .entry(session_id.to_string())
            .or_insert_with(|| StateRecord::empty(session_id));
        if live.is_none() {
            record.created_at = now;
        }
        record.fields = fields.clone();
        record.version = base + 1;
        record.updated_at = now;

        debug!(session_id = %session_id, version = record.version, "State record written to memory");
        Ok(record.version)
    }

    async fn delete(&self, session_id: &str) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let record = inner
            .records
            .remove(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        inner
            .tombstones
            .insert(session_id.to_string(), record.version + 1);
        debug!(session_id = %session_id, tombstone = record.version + 1, "State record deleted from memory");
        Ok(())
    }

    async fn touch(&self, session_id: &str) -> StoreResult<Session> {
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        let session = inner
            .sessions
            .entry(session_id.to_string())
            .and_modify(|s| s.last_seen_at = now)
            .or_insert_with(|| Session {
                session_id: session_id.to_string(),
                created_at: now,
                last_seen_at: now,
            });
        Ok(session.clone())
    }

    async fn session(&self, session_id: &str) -> StoreResult<Option<Session>> {
        let inner = self.inner.read().await;
        Ok(inner.sessions.get(session_id).cloned())
    }

    async fn list_keys(&self) -> StoreResult<Vec<String>> {
        let inner = self.inner.read().await;
        let mut keys: Vec<String> = inner.records.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(pairs: &[(&str, serde_json::Value)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_memory_store_create_and_update() {
        let store = MemoryStore::new();
        assert!(store.get("u1").await.unwrap().is_none());

        let v1 = store
            .put("u1", &fields(&[("user_name", json!("Alice"))]), 0)
            .await
            .unwrap();
        assert_eq!(v1, 1);

        let v2 = store
            .put("u1", &fields(&[("user_name", json!("Bob"))]), 1)
            .await
            .unwrap();
        assert_eq!(v2, 2);

        let record = store.get("u1").await.unwrap().unwrap();
        assert_eq!(record.version, 2);
        assert_eq!(record.fields["user_name"], json!("Bob"));
        assert_eq!(store.count().await, 1);
    }

    #[tokio::test]
    async fn test_memory_store_create_twice_conflicts() {
        let store = MemoryStore::new();
        store.put("u1", &Fields::new(), 0).await.unwrap();

        let err = store.put("u1", &Fields::new(), 0).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::VersionConflict {
                session_id: "u1".to_string(),
                expected: 0,
                actual: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_memory_store_stale_version_leaves_record_untouched() {
        let store = MemoryStore::new();
        store
            .put("u1", &fields(&[("city", json!("Paris"))]), 0)
            .await
            .unwrap();
        store
            .put("u1", &fields(&[("city", json!("Rome"))]), 1)
            .await
            .unwrap();

        let err = store
            .put("u1", &fields(&[("city", json!("Oslo"))]), 1)
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let record = store.get("u1").await.unwrap().unwrap();
        assert_eq!(record.version, 2);
        assert_eq!(record.fields["city"], json!("Rome"));
    }

    #[tokio::test]
    async fn test_memory_store_delete() {
        let store = MemoryStore::new();
        store.put("u1", &Fields::new(), 0).await.unwrap();

        store.delete("u1").await.unwrap();
        assert!(store.get("u1").await.unwrap().is_none());
        assert_eq!(
            store.delete("u1").await.unwrap_err(),
            StoreError::NotFound("u1".to_string())
        );
    }

    #[tokio::test]
    async fn test_memory_store_versions_keep_rising_across_delete() {
        let store = MemoryStore::new();
        store
            .put("u1", &fields(&[("user_name", json!("Alice"))]), 0)
            .await
            .unwrap();
        store.delete("u1").await.unwrap();

        // A writer still holding version 1 must not match the recreated record
        let err = store
            .put("u1", &fields(&[("mood", json!("happy"))]), 1)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::VersionConflict {
                session_id: "u1".to_string(),
                expected: 1,
                actual: 2,
            }
        );

        let recreated = store
            .put("u1", &fields(&[("city", json!("Paris"))]), 0)
            .await
            .unwrap();
        assert_eq!(recreated, 3);
        assert!(store.put("u1", &Fields::new(), 1).await.unwrap_err().is_conflict());

        let record = store.get("u1").await.unwrap().unwrap();
        assert_eq!(record.version, 3);
        assert_eq!(record.fields, fields(&[("city", json!("Paris"))]));
    }

    #[tokio::test]
    async fn test_memory_store_touch_keeps_created_at() {
        let store = MemoryStore::new();
        let first = store.touch("u1").await.unwrap();
        let second = store.touch("u1").await.unwrap();

        assert_eq!(first.created_at, second.created_at);
        assert!(second.last_seen_at >= first.last_seen_at);
        assert!(store.get("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store_list_keys() {
        let store = MemoryStore::new();
        store.put("key2", &Fields::new(), 0).await.unwrap();
        store.put("key1", &Fields::new(), 0).await.unwrap();
        store.touch("key3").await.unwrap();

        assert_eq!(store.list_keys().await.unwrap(), vec!["key1", "key2"]);
    }
}
