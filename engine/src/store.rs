//! Local storage.
//!
//! The engine never owns the local database. It reads and writes records
//! through [`LocalStore`], which the host application implements on top of
//! whatever it persists to. [`MemoryStore`] is the in-memory reference.

use crate::{error::Result, Record};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;

/// Reserved collection holding the engine's own persisted state.
pub const STATE_COLLECTION: &str = "_tether_state";

/// Local record storage, keyed by collection and record id.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Record>>;

    async fn put(&self, collection: &str, record: Record) -> Result<()>;

    /// Remove a record entirely. Missing keys are not an error.
    async fn delete(&self, collection: &str, key: &str) -> Result<()>;

    /// Every record of a collection, tombstones included.
    async fn scan_all(&self, collection: &str) -> Result<Vec<Record>>;
}

/// In-memory [`LocalStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: DashMap<String, BTreeMap<String, Record>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records in a collection, tombstones included.
    pub fn len(&self, collection: &str) -> usize {
        self.collections.get(collection).map_or(0, |c| c.len())
    }

    pub fn is_empty(&self) -> bool {
        self.collections.iter().all(|c| c.is_empty())
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Record>> {
        Ok(self
            .collections
            .get(collection)
            .and_then(|c| c.get(key).cloned()))
    }

    async fn put(&self, collection: &str, record: Record) -> Result<()> {
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(record.id.clone(), record);
        Ok(())
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<()> {
        if let Some(mut c) = self.collections.get_mut(collection) {
            c.remove(key);
        }
        Ok(())
    }

    async fn scan_all(&self, collection: &str) -> Result<Vec<Record>> {
        Ok(self
            .collections
            .get(collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn put_get_delete() {
        let store = MemoryStore::new();
        assert!(store.is_empty());

        store
            .put("card", Record::new("card", "c1", json!({"title": "A"}), 0, 1))
            .await
            .unwrap();
        let record = store.get("card", "c1").await.unwrap().unwrap();
        assert_eq!(record.data["title"], "A");
        assert_eq!(store.len("card"), 1);

        store.delete("card", "c1").await.unwrap();
        assert!(store.get("card", "c1").await.unwrap().is_none());
        store.delete("card", "missing").await.unwrap();
    }

    #[tokio::test]
    async fn scan_is_ordered_and_scoped() {
        let store = MemoryStore::new();
        for id in ["b", "a", "c"] {
            store
                .put("card", Record::new("card", id, json!({}), 0, 1))
                .await
                .unwrap();
        }
        store
            .put("folder", Record::new("folder", "f1", json!({}), 0, 1))
            .await
            .unwrap();

        let ids: Vec<_> = store
            .scan_all("card")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(store.scan_all("board").await.unwrap().is_empty());
    }
}
