use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{DurableStore, StoreError};

/// Process-local store. Used when no durable backend is configured and in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    namespaces: Mutex<HashMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records in a namespace.
    pub fn len(&self, namespace: &str) -> usize {
        self.namespaces
            .lock()
            .get(namespace)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    pub fn is_empty(&self, namespace: &str) -> bool {
        self.len(namespace) == 0
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn read(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .namespaces
            .lock()
            .get(namespace)
            .and_then(|ns| ns.get(key).cloned()))
    }

    async fn write(&self, namespace: &str, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.namespaces
            .lock()
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        if let Some(ns) = self.namespaces.lock().get_mut(namespace) {
            ns.remove(key);
        }
        Ok(())
    }

    async fn keys(&self, namespace: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .namespaces
            .lock()
            .get(namespace)
            .map(|ns| ns.keys().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        assert_eq!(store.read("favorites", "08NA011").await.unwrap(), None);

        store.write("favorites", "08NA011", b"true".to_vec()).await.unwrap();
        assert_eq!(
            store.read("favorites", "08NA011").await.unwrap(),
            Some(b"true".to_vec())
        );
        assert_eq!(store.keys("favorites").await.unwrap(), vec!["08NA011"]);

        store.remove("favorites", "08NA011").await.unwrap();
        assert!(store.is_empty("favorites"));
        store.remove("favorites", "08NA011").await.unwrap();
    }
}
