use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::clock::{std_duration, Clock, SystemClock};

/// Freshness policy of one namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceConfig {
    pub ttl: Duration,
    /// Extra time after `ttl` during which a stale value may still be served.
    pub grace: Duration,
}

impl NamespaceConfig {
    pub fn new(ttl: Duration, grace: Duration) -> Self {
        Self { ttl, grace }
    }

    /// Classify an entry age against this policy.
    pub fn freshness(&self, age: Duration) -> Freshness {
        if age < self.ttl {
            Freshness::Fresh
        } else if age < self.ttl.saturating_add(self.grace) {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Younger than the TTL.
    Fresh,
    /// Past the TTL but inside the grace window.
    Stale,
    /// Past TTL + grace; only usable as a last resort.
    Expired,
}

/// A cached value. Entries are replaced whole, never mutated in place.
#[derive(Debug)]
pub struct CacheEntry<V> {
    pub value: Arc<V>,
    pub inserted_at: DateTime<Utc>,
    /// Tag of the source that produced the value.
    pub source: String,
}

impl<V> Clone for CacheEntry<V> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            inserted_at: self.inserted_at,
            source: self.source.clone(),
        }
    }
}

/// Read-only view returned by [`CacheStore::get`].
#[derive(Debug)]
pub struct Cached<V> {
    pub value: Arc<V>,
    pub inserted_at: DateTime<Utc>,
    pub source: String,
    pub age: Duration,
    pub freshness: Freshness,
}

impl<V> Clone for Cached<V> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            inserted_at: self.inserted_at,
            source: self.source.clone(),
            age: self.age,
            freshness: self.freshness,
        }
    }
}

struct Partition<V> {
    config: NamespaceConfig,
    entries: HashMap<String, Arc<CacheEntry<V>>>,
}

/// Namespaced in-memory TTL cache.
///
/// The store never performs I/O and has no refresh policy of its own: it
/// only reports how old an entry is and how that age compares to the
/// namespace TTL. Lookups in unknown namespaces are misses.
pub struct CacheStore<V> {
    partitions: RwLock<HashMap<String, Partition<V>>>,
    clock: Arc<dyn Clock>,
}

impl<V> CacheStore<V> {
    pub fn new<I, S>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = (S, NamespaceConfig)>,
        S: Into<String>,
    {
        Self::with_clock(namespaces, Arc::new(SystemClock))
    }

    pub fn with_clock<I, S>(namespaces: I, clock: Arc<dyn Clock>) -> Self
    where
        I: IntoIterator<Item = (S, NamespaceConfig)>,
        S: Into<String>,
    {
        let partitions = namespaces
            .into_iter()
            .map(|(name, config)| {
                (
                    name.into(),
                    Partition {
                        config,
                        entries: HashMap::new(),
                    },
                )
            })
            .collect();
        Self {
            partitions: RwLock::new(partitions),
            clock,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Register (or reconfigure) a namespace. Existing entries are kept.
    pub fn register(&self, namespace: impl Into<String>, config: NamespaceConfig) {
        let mut partitions = self.partitions.write();
        partitions
            .entry(namespace.into())
            .and_modify(|p| p.config = config)
            .or_insert_with(|| Partition {
                config,
                entries: HashMap::new(),
            });
    }

    pub fn namespace_config(&self, namespace: &str) -> Option<NamespaceConfig> {
        self.partitions.read().get(namespace).map(|p| p.config)
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.partitions.read().keys().cloned().collect()
    }

    /// Look up a key. Ages are measured against the store's clock; an entry
    /// stamped in the future counts as age zero.
    pub fn get(&self, namespace: &str, key: &str) -> Option<Cached<V>> {
        let partitions = self.partitions.read();
        let partition = partitions.get(namespace)?;
        let entry = partition.entries.get(key)?;
        let age = std_duration(self.clock.now() - entry.inserted_at);
        Some(Cached {
            value: Arc::clone(&entry.value),
            inserted_at: entry.inserted_at,
            source: entry.source.clone(),
            age,
            freshness: partition.config.freshness(age),
        })
    }

    /// Store a value stamped with the current time.
    pub fn put(&self, namespace: &str, key: &str, value: V, source: impl Into<String>) -> bool {
        let now = self.clock.now();
        self.put_at(namespace, key, value, source, now)
    }

    /// Store a value stamped with `inserted_at`.
    ///
    /// Rejected (returns `false`) when the namespace is unknown or the current
    /// entry is stamped later than `inserted_at`.
    pub fn put_at(
        &self,
        namespace: &str,
        key: &str,
        value: V,
        source: impl Into<String>,
        inserted_at: DateTime<Utc>,
    ) -> bool {
        let entry = CacheEntry {
            value: Arc::new(value),
            inserted_at,
            source: source.into(),
        };
        self.put_entry(namespace, key, entry)
    }

    pub fn put_entry(&self, namespace: &str, key: &str, entry: CacheEntry<V>) -> bool {
        let mut partitions = self.partitions.write();
        let Some(partition) = partitions.get_mut(namespace) else {
            warn!(namespace = namespace, key = key, "Put into unknown cache namespace ignored");
            return false;
        };

        if let Some(existing) = partition.entries.get(key) {
            if existing.inserted_at > entry.inserted_at {
                debug!(
                    namespace = namespace,
                    key = key,
                    existing = %existing.inserted_at,
                    incoming = %entry.inserted_at,
                    "Discarding older cache write"
                );
                return false;
            }
        }

        partition.entries.insert(key.to_string(), Arc::new(entry));
        true
    }

    /// Drop one key, or the whole namespace when `key` is `None`.
    pub fn invalidate(&self, namespace: &str, key: Option<&str>) {
        let mut partitions = self.partitions.write();
        if let Some(partition) = partitions.get_mut(namespace) {
            match key {
                Some(key) => {
                    partition.entries.remove(key);
                }
                None => partition.entries.clear(),
            }
        }
    }

    /// Snapshot of every entry in a namespace.
    pub fn entries(&self, namespace: &str) -> Vec<(String, CacheEntry<V>)> {
        self.partitions
            .read()
            .get(namespace)
            .map(|p| {
                p.entries
                    .iter()
                    .map(|(k, e)| (k.clone(), CacheEntry::clone(e)))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self, namespace: &str) -> usize {
        self.partitions
            .read()
            .get(namespace)
            .map(|p| p.entries.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, namespace: &str) -> bool {
        self.len(namespace) == 0
    }

    /// Time left before an entry of the given age turns stale.
    pub fn time_to_stale(&self, namespace: &str, age: Duration) -> Option<Duration> {
        let config = self.namespace_config(namespace)?;
        Some(config.ttl.saturating_sub(age))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    const LIVE: &str = "live-reading";
    const META: &str = "static-metadata";

    fn store() -> (CacheStore<String>, Arc<ManualClock>) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 10, 16, 12, 0, 0).unwrap());
        let store = CacheStore::with_clock(
            [
                (LIVE, NamespaceConfig::new(Duration::from_secs(300), Duration::from_secs(600))),
                (META, NamespaceConfig::new(Duration::from_secs(86_400), Duration::ZERO)),
            ],
            clock.clone(),
        );
        (store, clock)
    }

    // -------------------------------------------------------------------------
    // Freshness
    // -------------------------------------------------------------------------

    #[test]
    fn test_freshness_boundaries() {
        let config = NamespaceConfig::new(Duration::from_secs(300), Duration::from_secs(600));
        assert_eq!(config.freshness(Duration::from_secs(299)), Freshness::Fresh);
        assert_eq!(config.freshness(Duration::from_secs(300)), Freshness::Stale);
        assert_eq!(config.freshness(Duration::from_secs(899)), Freshness::Stale);
        assert_eq!(config.freshness(Duration::from_secs(900)), Freshness::Expired);
    }

    #[test]
    fn test_zero_grace_goes_straight_to_expired() {
        let config = NamespaceConfig::new(Duration::from_secs(60), Duration::ZERO);
        assert_eq!(config.freshness(Duration::from_secs(60)), Freshness::Expired);
    }

    // -------------------------------------------------------------------------
    // Get / Put
    // -------------------------------------------------------------------------

    #[test]
    fn test_get_reports_age_and_freshness() {
        let (store, clock) = store();
        assert!(store.put(LIVE, "08NA011", "8.43".to_string(), "datamart-csv"));

        let hit = store.get(LIVE, "08NA011").unwrap();
        assert_eq!(*hit.value, "8.43");
        assert_eq!(hit.source, "datamart-csv");
        assert_eq!(hit.age, Duration::ZERO);
        assert_eq!(hit.freshness, Freshness::Fresh);

        clock.advance(chrono::Duration::minutes(6));
        let stale = store.get(LIVE, "08NA011").unwrap();
        assert_eq!(stale.age, Duration::from_secs(360));
        assert_eq!(stale.freshness, Freshness::Stale);
    }

    #[test]
    fn test_miss_on_unknown_key_and_namespace() {
        let (store, _) = store();
        assert!(store.get(LIVE, "nope").is_none());
        assert!(store.get("forecast", "nope").is_none());
        assert!(!store.put("forecast", "k", "v".to_string(), "x"));
    }

    #[test]
    fn test_namespaces_are_independent() {
        let (store, clock) = store();
        store.put(LIVE, "k", "live".to_string(), "a");
        store.put(META, "k", "meta".to_string(), "b");

        clock.advance(chrono::Duration::hours(1));
        assert_eq!(store.get(LIVE, "k").unwrap().freshness, Freshness::Expired);
        assert_eq!(store.get(META, "k").unwrap().freshness, Freshness::Fresh);
        assert_eq!(*store.get(META, "k").unwrap().value, "meta");
    }

    #[test]
    fn test_older_write_does_not_overwrite_newer() {
        let (store, clock) = store();
        let early = clock.now();
        clock.advance(chrono::Duration::seconds(10));
        let late = clock.now();

        assert!(store.put_at(LIVE, "k", "new".to_string(), "b", late));
        assert!(!store.put_at(LIVE, "k", "old".to_string(), "a", early));
        assert_eq!(*store.get(LIVE, "k").unwrap().value, "new");
    }

    #[test]
    fn test_replace_keeps_previous_views_intact() {
        let (store, _) = store();
        store.put(LIVE, "k", "first".to_string(), "a");
        let view = store.get(LIVE, "k").unwrap();
        store.put(LIVE, "k", "second".to_string(), "a");
        assert_eq!(*view.value, "first");
        assert_eq!(*store.get(LIVE, "k").unwrap().value, "second");
    }

    // -------------------------------------------------------------------------
    // Invalidation
    // -------------------------------------------------------------------------

    #[test]
    fn test_invalidate_single_key() {
        let (store, _) = store();
        store.put(LIVE, "a", "1".to_string(), "s");
        store.put(LIVE, "b", "2".to_string(), "s");
        store.invalidate(LIVE, Some("a"));
        assert!(store.get(LIVE, "a").is_none());
        assert!(store.get(LIVE, "b").is_some());
    }

    #[test]
    fn test_invalidate_whole_namespace() {
        let (store, _) = store();
        store.put(LIVE, "a", "1".to_string(), "s");
        store.put(LIVE, "b", "2".to_string(), "s");
        store.put(META, "a", "3".to_string(), "s");
        store.invalidate(LIVE, None);
        assert!(store.is_empty(LIVE));
        assert_eq!(store.len(META), 1);
    }

    #[test]
    fn test_register_keeps_entries() {
        let (store, _) = store();
        store.put(LIVE, "a", "1".to_string(), "s");
        store.register(LIVE, NamespaceConfig::new(Duration::from_secs(1), Duration::ZERO));
        assert_eq!(store.len(LIVE), 1);
        assert_eq!(
            store.namespace_config(LIVE).unwrap().ttl,
            Duration::from_secs(1)
        );
    }
}
