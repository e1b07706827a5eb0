//! Request coordination on top of the cache.
//!
//! For every `(namespace, key)` the coordinator guarantees:
//!
//! - at most one upstream fetch in flight; concurrent callers await the same
//!   shared result
//! - a minimum interval between fetch attempts; inside it callers get the
//!   best cached value and a refresh is scheduled for when the interval ends
//! - stale-while-revalidate: entries past their TTL but inside the grace
//!   window are served immediately while a background refresh runs
//!
//! Fetches run on their own tokio task, so a caller dropping its future does
//! not cancel the fetch other callers are waiting on. Failed fetches are
//! never cached.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use crate::cache::{CacheEntry, CacheStore, Cached, Freshness, SnapshotAdapter};
use crate::clock::std_duration;
use crate::fetch::{FallbackChain, FetchError};

/// How a resolved value was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Cache hit inside the TTL.
    Fresh,
    /// Served past the TTL while a background refresh runs.
    Stale,
    /// Produced by an upstream fetch during this call.
    Fetched,
    /// Served from cache because the rate limit deferred the fetch.
    Deferred,
    /// Expired cache entry served because the fetch failed.
    LastKnownGood,
}

/// Result of [`RequestCoordinator::resolve`].
#[derive(Debug)]
pub struct Resolved<V> {
    pub value: Arc<V>,
    /// Tag of the source that produced the value.
    pub source: String,
    pub age: Duration,
    pub origin: Origin,
}

impl<V> Clone for Resolved<V> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            source: self.source.clone(),
            age: self.age,
            origin: self.origin,
        }
    }
}

impl<V> Resolved<V> {
    fn from_cached(cached: Cached<V>, origin: Origin) -> Self {
        Self {
            value: cached.value,
            source: cached.source,
            age: cached.age,
            origin,
        }
    }
}

/// Minimum interval between fetch attempts, per namespace or per key.
#[derive(Debug, Clone, Default)]
pub struct RateLimits {
    default: Duration,
    /// Keyed by `"<namespace>"` or `"<namespace>/<key>"`.
    overrides: HashMap<String, Duration>,
}

impl RateLimits {
    pub fn new(default: Duration) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    /// Override the interval for a namespace (`"live-reading"`) or a single
    /// key (`"live-reading/08NA011:BC"`).
    pub fn with_override(mut self, scope: impl Into<String>, interval: Duration) -> Self {
        self.overrides.insert(scope.into(), interval);
        self
    }

    /// The most specific interval configured for a key.
    pub fn interval_for(&self, namespace: &str, key: &str) -> Duration {
        self.overrides
            .get(&format!("{}/{}", namespace, key))
            .or_else(|| self.overrides.get(namespace))
            .copied()
            .unwrap_or(self.default)
    }
}

type FetchId = (String, String);
type SharedFetch<V> = Shared<BoxFuture<'static, Result<Resolved<V>, FetchError>>>;

struct State<V> {
    in_flight: HashMap<FetchId, SharedFetch<V>>,
    last_attempt: HashMap<FetchId, DateTime<Utc>>,
    scheduled: HashSet<FetchId>,
}

struct Inner<V> {
    cache: Arc<CacheStore<V>>,
    snapshot: Option<Arc<SnapshotAdapter<V>>>,
    limits: RateLimits,
    state: Mutex<State<V>>,
}

/// What to do on the blocking path once the lock is released.
enum Step<V> {
    Join(SharedFetch<V>),
    Deferred(Duration),
}

/// Removes the in-flight registration when the fetch task ends, including
/// by panic.
struct InFlightGuard<V> {
    inner: Arc<Inner<V>>,
    id: FetchId,
}

impl<V> Drop for InFlightGuard<V> {
    fn drop(&mut self) {
        self.inner.state.lock().in_flight.remove(&self.id);
    }
}

/// Cheap to clone; clones share the same cache and in-flight table.
pub struct RequestCoordinator<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for RequestCoordinator<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> RequestCoordinator<V>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(cache: Arc<CacheStore<V>>, limits: RateLimits) -> Self {
        Self::build(cache, limits, None)
    }

    /// Mirror every successful fetch into `snapshot`.
    pub fn with_snapshot(cache: Arc<CacheStore<V>>, limits: RateLimits, snapshot: Arc<SnapshotAdapter<V>>) -> Self {
        Self::build(cache, limits, Some(snapshot))
    }

    fn build(cache: Arc<CacheStore<V>>, limits: RateLimits, snapshot: Option<Arc<SnapshotAdapter<V>>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache,
                snapshot,
                limits,
                state: Mutex::new(State {
                    in_flight: HashMap::new(),
                    last_attempt: HashMap::new(),
                    scheduled: HashSet::new(),
                }),
            }),
        }
    }

    pub fn cache(&self) -> &Arc<CacheStore<V>> {
        &self.inner.cache
    }

    /// Get a value, fetching through `chain` only when the cache cannot
    /// answer.
    ///
    /// Errors only on a true cold miss: when any cached value exists it is
    /// preferred over reporting a failed or deferred fetch.
    pub async fn resolve(
        &self,
        namespace: &str,
        key: &str,
        chain: &Arc<FallbackChain<V>>,
    ) -> Result<Resolved<V>, FetchError> {
        match self.inner.cache.get(namespace, key) {
            Some(cached) if cached.freshness == Freshness::Fresh => {
                debug!(namespace = namespace, key = key, age = ?cached.age, "Cache hit");
                return Ok(Resolved::from_cached(cached, Origin::Fresh));
            }
            Some(cached) if cached.freshness == Freshness::Stale => {
                debug!(namespace = namespace, key = key, age = ?cached.age, "Serving stale entry");
                self.revalidate(namespace, key, chain);
                return Ok(Resolved::from_cached(cached, Origin::Stale));
            }
            Some(cached) => {
                debug!(namespace = namespace, key = key, age = ?cached.age, "Cache entry expired");
            }
            None => {
                debug!(namespace = namespace, key = key, "Cache miss");
            }
        }

        self.fetch_or_fallback(namespace, key, chain).await
    }

    /// Fetch regardless of the cached entry's age.
    ///
    /// Still joins an in-flight fetch and still honours the rate limit.
    pub async fn refresh(
        &self,
        namespace: &str,
        key: &str,
        chain: &Arc<FallbackChain<V>>,
    ) -> Result<Resolved<V>, FetchError> {
        debug!(namespace = namespace, key = key, "Forced refresh");
        self.fetch_or_fallback(namespace, key, chain).await
    }

    /// Drop a key (or a whole namespace) from the cache and its snapshot.
    pub async fn invalidate(&self, namespace: &str, key: Option<&str>) {
        self.inner.cache.invalidate(namespace, key);
        if let Some(snapshot) = &self.inner.snapshot {
            if let Err(e) = snapshot.remove(namespace, key).await {
                warn!(namespace = namespace, key = ?key, error = %e, "Failed to remove snapshot records");
            }
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.state.lock().in_flight.len()
    }

    pub fn is_in_flight(&self, namespace: &str, key: &str) -> bool {
        self.inner
            .state
            .lock()
            .in_flight
            .contains_key(&(namespace.to_string(), key.to_string()))
    }

    /// When the last fetch attempt for a key started. Attempts older than
    /// the key's rate-limit interval are forgotten when other fetches start.
    pub fn last_attempt(&self, namespace: &str, key: &str) -> Option<DateTime<Utc>> {
        self.inner
            .state
            .lock()
            .last_attempt
            .get(&(namespace.to_string(), key.to_string()))
            .copied()
    }

    async fn fetch_or_fallback(
        &self,
        namespace: &str,
        key: &str,
        chain: &Arc<FallbackChain<V>>,
    ) -> Result<Resolved<V>, FetchError> {
        match self.join_or_start(namespace, key, chain) {
            Step::Join(fetch) => match fetch.await {
                Ok(resolved) => Ok(resolved),
                Err(e) => self.last_known_good(namespace, key, e),
            },
            Step::Deferred(wait) => self.deferred(namespace, key, chain, wait),
        }
    }

    fn join_or_start(&self, namespace: &str, key: &str, chain: &Arc<FallbackChain<V>>) -> Step<V> {
        let id = (namespace.to_string(), key.to_string());
        let mut state = self.inner.state.lock();

        if let Some(fetch) = state.in_flight.get(&id) {
            debug!(namespace = namespace, key = key, "Joining in-flight fetch");
            return Step::Join(fetch.clone());
        }
        if let Some(wait) = self.rate_limit_remaining(&state, &id) {
            debug!(namespace = namespace, key = key, retry_after = ?wait, "Fetch deferred by rate limit");
            return Step::Deferred(wait);
        }
        Step::Join(self.start_fetch(&mut state, id, chain))
    }

    /// Time left before another attempt is allowed, if any.
    fn rate_limit_remaining(&self, state: &State<V>, id: &FetchId) -> Option<Duration> {
        let last = state.last_attempt.get(id)?;
        let interval = self.inner.limits.interval_for(&id.0, &id.1);
        let elapsed = std_duration(self.inner.cache.clock().now() - *last);
        (elapsed < interval).then(|| interval - elapsed)
    }

    /// Register and spawn a fetch. Caller holds the state lock.
    fn start_fetch(&self, state: &mut State<V>, id: FetchId, chain: &Arc<FallbackChain<V>>) -> SharedFetch<V> {
        let started = self.inner.cache.clock().now();
        let limits = &self.inner.limits;
        state
            .last_attempt
            .retain(|(namespace, key), at| std_duration(started - *at) < limits.interval_for(namespace, key));
        state.last_attempt.insert(id.clone(), started);

        let guard = InFlightGuard {
            inner: Arc::clone(&self.inner),
            id: id.clone(),
        };
        let chain = Arc::clone(chain);
        let task = tokio::spawn(async move {
            let guard = guard;
            let (namespace, key) = &guard.id;
            debug!(namespace = %namespace, key = %key, sources = chain.len(), "Fetch started");
            let result = chain.fetch(key).await;
            guard.inner.complete(namespace, key, started, result)
        });

        let key = id.1.clone();
        let fetch = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(FetchError::Aborted {
                    key,
                    reason: e.to_string(),
                }),
            }
        }
        .boxed()
        .shared();

        state.in_flight.insert(id, fetch.clone());
        fetch
    }

    /// Stale path: refresh in the background unless a fetch is already
    /// running or the rate limit says to wait.
    fn revalidate(&self, namespace: &str, key: &str, chain: &Arc<FallbackChain<V>>) {
        let id = (namespace.to_string(), key.to_string());
        let mut state = self.inner.state.lock();

        if state.in_flight.contains_key(&id) {
            debug!(namespace = namespace, key = key, "Refresh already in flight");
            return;
        }
        match self.rate_limit_remaining(&state, &id) {
            Some(wait) => self.schedule(&mut state, id, chain, wait),
            None => {
                debug!(namespace = namespace, key = key, "Starting background refresh");
                // Nobody awaits a background refresh; the spawned task owns it.
                drop(self.start_fetch(&mut state, id, chain));
            }
        }
    }

    /// Blocking path inside the rate-limit window.
    fn deferred(
        &self,
        namespace: &str,
        key: &str,
        chain: &Arc<FallbackChain<V>>,
        wait: Duration,
    ) -> Result<Resolved<V>, FetchError> {
        match self.inner.cache.get(namespace, key) {
            Some(cached) if cached.freshness == Freshness::Fresh => Ok(Resolved::from_cached(cached, Origin::Fresh)),
            Some(cached) => {
                let id = (namespace.to_string(), key.to_string());
                let mut state = self.inner.state.lock();
                self.schedule(&mut state, id, chain, wait);
                Ok(Resolved::from_cached(cached, Origin::Deferred))
            }
            None => Err(FetchError::RateLimited {
                key: key.to_string(),
                retry_after: wait,
            }),
        }
    }

    /// Arrange one refresh for when the rate-limit interval elapses.
    fn schedule(&self, state: &mut State<V>, id: FetchId, chain: &Arc<FallbackChain<V>>, wait: Duration) {
        if !state.scheduled.insert(id.clone()) {
            return;
        }
        debug!(namespace = %id.0, key = %id.1, delay = ?wait, "Background refresh scheduled");

        let this = self.clone();
        let chain = Arc::clone(chain);
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            this.fire_scheduled(id, &chain);
        });
    }

    fn fire_scheduled(&self, id: FetchId, chain: &Arc<FallbackChain<V>>) {
        let mut state = self.inner.state.lock();
        state.scheduled.remove(&id);

        if state.in_flight.contains_key(&id) {
            debug!(namespace = %id.0, key = %id.1, "Scheduled refresh skipped, fetch already in flight");
            return;
        }
        let fresh = self
            .inner
            .cache
            .get(&id.0, &id.1)
            .is_some_and(|c| c.freshness == Freshness::Fresh);
        if fresh {
            debug!(namespace = %id.0, key = %id.1, "Scheduled refresh skipped, entry is fresh");
            return;
        }
        drop(self.start_fetch(&mut state, id, chain));
    }

    fn last_known_good(&self, namespace: &str, key: &str, error: FetchError) -> Result<Resolved<V>, FetchError> {
        match self.inner.cache.get(namespace, key) {
            Some(cached) => {
                warn!(
                    namespace = namespace,
                    key = key,
                    age = ?cached.age,
                    error = %error,
                    "Fetch failed, serving last known good value"
                );
                Ok(Resolved::from_cached(cached, Origin::LastKnownGood))
            }
            None => Err(error),
        }
    }
}

impl<V> Inner<V>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Apply a finished fetch to the cache. Runs on the fetch task, before the
    /// in-flight registration is dropped.
    fn complete(
        &self,
        namespace: &str,
        key: &str,
        started: DateTime<Utc>,
        result: Result<crate::fetch::Fetched<V>, FetchError>,
    ) -> Result<Resolved<V>, FetchError> {
        let fetched = result?;
        let entry = CacheEntry {
            value: Arc::new(fetched.value),
            inserted_at: started,
            source: fetched.source,
        };

        if self.cache.put_entry(namespace, key, entry.clone()) {
            debug!(namespace = namespace, key = key, source = %entry.source, "Fetch stored");
            if let Some(snapshot) = &self.snapshot {
                snapshot.mirror(namespace, key, entry.clone());
            }
        } else if let Some(newer) = self.cache.get(namespace, key) {
            // A fetch that started later already landed; hand out its value.
            return Ok(Resolved::from_cached(newer, Origin::Fetched));
        }

        Ok(Resolved {
            age: std_duration(self.cache.clock().now() - entry.inserted_at),
            value: entry.value,
            source: entry.source,
            origin: Origin::Fetched,
        })
    }
}
