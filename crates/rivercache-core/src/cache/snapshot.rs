//! Mirrors cache namespaces into a durable store.
//!
//! Layout inside the durable namespace (default `cache-snapshot`):
//!
//! ```text
//! v/<namespace>/<key>  ->  {"source": "...", "inserted_at": "...", "value": ...}
//! t/<namespace>/<key>  ->  "2025-10-16T12:00:00Z"
//! ```
//!
//! Every value record has a companion timestamp record holding the entry's
//! `inserted_at`. Loading skips (and logs) individual records that are
//! malformed or lack a timestamp instead of failing the whole load.
//!
//! Saves of one key run one at a time, and a save never replaces a record
//! stamped later than the entry being saved.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::store::{CacheEntry, CacheStore};
use crate::store::{DurableStore, StoreError};

/// Durable namespace used when none is given.
pub const DEFAULT_SNAPSHOT_NAMESPACE: &str = "cache-snapshot";

const VALUE_PREFIX: &str = "v/";
const TIMESTAMP_PREFIX: &str = "t/";

#[derive(Serialize)]
struct RecordRef<'a, V> {
    source: &'a str,
    inserted_at: DateTime<Utc>,
    value: &'a V,
}

#[derive(Deserialize)]
struct Record<V> {
    source: String,
    /// Absent in records written before the stamp moved inline.
    #[serde(default)]
    inserted_at: Option<DateTime<Utc>>,
    value: V,
}

/// Outcome of [`SnapshotAdapter::load`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    /// Records that were malformed, orphaned or belong to an unknown namespace.
    pub skipped: usize,
    /// Valid records older than what the cache already held.
    pub superseded: usize,
}

pub struct SnapshotAdapter<V> {
    store: Arc<dyn DurableStore>,
    namespace: String,
    /// Per-record save locks, dropped once nobody holds or waits on them.
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    _value: std::marker::PhantomData<fn() -> V>,
}

impl<V> SnapshotAdapter<V>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self::with_namespace(store, DEFAULT_SNAPSHOT_NAMESPACE)
    }

    pub fn with_namespace(store: Arc<dyn DurableStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            locks: Mutex::new(HashMap::new()),
            _value: std::marker::PhantomData,
        }
    }

    fn value_key(namespace: &str, key: &str) -> String {
        format!("{}{}/{}", VALUE_PREFIX, namespace, key)
    }

    fn timestamp_key(namespace: &str, key: &str) -> String {
        format!("{}{}/{}", TIMESTAMP_PREFIX, namespace, key)
    }

    /// Restore every snapshot record into `cache`.
    ///
    /// Only a failure to enumerate the snapshot is an error; bad individual
    /// records are counted in [`LoadReport::skipped`].
    pub async fn load(&self, cache: &CacheStore<V>) -> Result<LoadReport, StoreError> {
        let keys = self.store.keys(&self.namespace).await?;
        let mut report = LoadReport::default();

        for record_key in keys {
            let Some(rest) = record_key.strip_prefix(VALUE_PREFIX) else {
                continue;
            };
            let Some((namespace, key)) = rest.split_once('/') else {
                warn!(record = %record_key, "Skipping snapshot record with malformed key");
                report.skipped += 1;
                continue;
            };
            if cache.namespace_config(namespace).is_none() {
                debug!(namespace = namespace, key = key, "Skipping snapshot record for unknown namespace");
                report.skipped += 1;
                continue;
            }

            match self.read_entry(namespace, key).await {
                Ok(entry) => {
                    if cache.put_entry(namespace, key, entry) {
                        report.loaded += 1;
                    } else {
                        report.superseded += 1;
                    }
                }
                Err(reason) => {
                    warn!(namespace = namespace, key = key, reason = %reason, "Skipping snapshot record");
                    report.skipped += 1;
                }
            }
        }

        info!(
            loaded = report.loaded,
            skipped = report.skipped,
            superseded = report.superseded,
            "Cache snapshot loaded"
        );
        Ok(report)
    }

    async fn read_entry(&self, namespace: &str, key: &str) -> Result<CacheEntry<V>, String> {
        let raw = self
            .store
            .read(&self.namespace, &Self::value_key(namespace, key))
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| "value record vanished".to_string())?;
        let record: Record<V> =
            serde_json::from_slice(&raw).map_err(|e| format!("bad value record: {}", e))?;

        let inserted_at = match record.inserted_at {
            Some(inserted_at) => inserted_at,
            None => {
                let raw_ts = self
                    .store
                    .read(&self.namespace, &Self::timestamp_key(namespace, key))
                    .await
                    .map_err(|e| e.to_string())?
                    .ok_or_else(|| "missing timestamp record".to_string())?;
                serde_json::from_slice(&raw_ts).map_err(|e| format!("bad timestamp record: {}", e))?
            }
        };

        Ok(CacheEntry {
            value: Arc::new(record.value),
            inserted_at,
            source: record.source,
        })
    }

    /// Persist one entry (value record first, then its timestamp).
    ///
    /// Returns `false` without writing when the snapshot already holds an
    /// entry stamped later than `entry`.
    pub async fn save(&self, namespace: &str, key: &str, entry: &CacheEntry<V>) -> Result<bool, StoreError> {
        let id = Self::value_key(namespace, key);
        let lock = self.record_lock(&id);
        let result = {
            let _guard = lock.lock().await;
            self.write_entry(namespace, key, entry).await
        };
        self.release_record_lock(&id, lock);
        result
    }

    async fn write_entry(&self, namespace: &str, key: &str, entry: &CacheEntry<V>) -> Result<bool, StoreError> {
        if let Some(stored) = self.stored_timestamp(namespace, key).await? {
            if stored > entry.inserted_at {
                debug!(namespace = namespace, key = key, stored = %stored, "Snapshot holds a newer entry, not saving");
                return Ok(false);
            }
        }

        let record = serde_json::to_vec(&RecordRef {
            source: &entry.source,
            inserted_at: entry.inserted_at,
            value: entry.value.as_ref(),
        })?;
        let timestamp = serde_json::to_vec(&entry.inserted_at)?;

        self.store
            .write(&self.namespace, &Self::value_key(namespace, key), record)
            .await?;
        self.store
            .write(&self.namespace, &Self::timestamp_key(namespace, key), timestamp)
            .await?;
        debug!(namespace = namespace, key = key, "Saved cache snapshot record");
        Ok(true)
    }

    /// Stamp of the saved entry; unreadable stamps count as absent.
    async fn stored_timestamp(&self, namespace: &str, key: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let raw = self
            .store
            .read(&self.namespace, &Self::timestamp_key(namespace, key))
            .await?;
        Ok(raw.and_then(|raw| serde_json::from_slice(&raw).ok()))
    }

    fn record_lock(&self, id: &str) -> Arc<AsyncMutex<()>> {
        Arc::clone(self.locks.lock().entry(id.to_string()).or_default())
    }

    fn release_record_lock(&self, id: &str, lock: Arc<AsyncMutex<()>>) {
        let mut locks = self.locks.lock();
        // The map's reference and ours: no other saver is waiting.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(id);
        }
    }

    /// Persist whatever the cache currently holds for a key. Returns `false`
    /// if there was nothing to save or the snapshot already had newer data.
    pub async fn save_key(&self, cache: &CacheStore<V>, namespace: &str, key: &str) -> Result<bool, StoreError> {
        let Some(cached) = cache.get(namespace, key) else {
            return Ok(false);
        };
        let entry = CacheEntry {
            value: cached.value,
            inserted_at: cached.inserted_at,
            source: cached.source,
        };
        self.save(namespace, key, &entry).await
    }

    /// Persist a whole namespace, returning how many entries were written.
    pub async fn save_namespace(&self, cache: &CacheStore<V>, namespace: &str) -> Result<usize, StoreError> {
        let mut written = 0;
        for (key, entry) in cache.entries(namespace) {
            if self.save(namespace, &key, &entry).await? {
                written += 1;
            }
        }
        Ok(written)
    }

    /// Persist every namespace; individual failures are logged, not returned.
    pub async fn save_all(&self, cache: &CacheStore<V>) -> usize {
        let mut saved = 0;
        for namespace in cache.namespaces() {
            match self.save_namespace(cache, &namespace).await {
                Ok(n) => saved += n,
                Err(e) => warn!(namespace = %namespace, error = %e, "Failed to save cache namespace"),
            }
        }
        saved
    }

    /// Remove one key's records, or a whole namespace's when `key` is `None`.
    pub async fn remove(&self, namespace: &str, key: Option<&str>) -> Result<(), StoreError> {
        match key {
            Some(key) => {
                let id = Self::value_key(namespace, key);
                let lock = self.record_lock(&id);
                let result = {
                    let _guard = lock.lock().await;
                    self.remove_records(namespace, key).await
                };
                self.release_record_lock(&id, lock);
                result?;
            }
            None => {
                let value_prefix = format!("{}{}/", VALUE_PREFIX, namespace);
                let timestamp_prefix = format!("{}{}/", TIMESTAMP_PREFIX, namespace);
                for record_key in self.store.keys(&self.namespace).await? {
                    if record_key.starts_with(&value_prefix) || record_key.starts_with(&timestamp_prefix) {
                        self.store.remove(&self.namespace, &record_key).await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn remove_records(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        self.store
            .remove(&self.namespace, &Self::value_key(namespace, key))
            .await?;
        self.store
            .remove(&self.namespace, &Self::timestamp_key(namespace, key))
            .await
    }

    /// Save an entry in the background. Failures are logged and retried on
    /// the next write of the same key.
    pub fn mirror(self: &Arc<Self>, namespace: &str, key: &str, entry: CacheEntry<V>) -> JoinHandle<()> {
        let adapter = Arc::clone(self);
        let namespace = namespace.to_string();
        let key = key.to_string();
        tokio::spawn(async move {
            if let Err(e) = adapter.save(&namespace, &key, &entry).await {
                warn!(namespace = %namespace, key = %key, error = %e, "Failed to mirror cache entry");
            }
        })
    }
}
