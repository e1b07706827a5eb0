//! Wiring of the core components for the command-line front end.
//!
//! One cache, one durable store and one coordinator per process, shared by
//! every command.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use rivercache_core::cache::LoadReport;
use rivercache_core::config::namespaces;
use rivercache_core::fetch::{default_client, FallbackChain, Fetcher, HttpFetcher};
use rivercache_core::mutation::FAVORITES_NAMESPACE;
use rivercache_core::timeline::{reconcile, Reconciled};
use rivercache_core::{
    CacheStore, Config, DurableStore, FetchError, FileStore, MutationQueue, Payload, RequestCoordinator, Resolved,
    SnapshotAdapter, SystemClock,
};

use crate::decoders;

/// Maximum concurrent station lookups.
const MAX_CONCURRENT_REQUESTS: usize = 8;

pub struct App {
    cache: Arc<CacheStore<Payload>>,
    snapshot: Arc<SnapshotAdapter<Payload>>,
    coordinator: RequestCoordinator<Payload>,
    chains: HashMap<String, Arc<FallbackChain<Payload>>>,
    favorites: MutationQueue,
    store: Arc<dyn DurableStore>,
    config: Config,
}

impl App {
    pub async fn new(config: Config) -> Result<Self> {
        let store_dir = config.store_dir()?;
        let store: Arc<dyn DurableStore> = Arc::new(
            FileStore::new(store_dir.clone()).with_context(|| format!("Failed to open store at {}", store_dir.display()))?,
        );

        let clock = Arc::new(SystemClock);
        let cache = Arc::new(CacheStore::with_clock(config.cache_namespaces(), clock.clone()));
        let snapshot = Arc::new(SnapshotAdapter::new(Arc::clone(&store)));
        let coordinator = RequestCoordinator::with_snapshot(Arc::clone(&cache), config.rate_limits(), Arc::clone(&snapshot));

        let client = default_client()?;
        let decoders = decoders::registry();
        let mut chains = HashMap::new();
        for (class, sources) in &config.sources {
            let chain = FallbackChain::from_settings(
                sources,
                |s| Ok(Arc::new(HttpFetcher::with_client(client.clone(), s.url.clone())) as Arc<dyn Fetcher>),
                &decoders,
                clock.clone(),
            )
            .with_context(|| format!("Invalid sources for '{}'", class))?;
            debug!(class = %class, sources = ?chain.tags(), "Fallback chain ready");
            chains.insert(class.clone(), Arc::new(chain));
        }

        let favorites = MutationQueue::new(Arc::clone(&store), config.debounce())?;

        Ok(Self {
            cache,
            snapshot,
            coordinator,
            chains,
            favorites,
            store,
            config,
        })
    }

    /// Restore the cache snapshot and committed favourites.
    pub async fn load_from_cache(&self) -> Result<LoadReport> {
        let report = self.snapshot.load(&self.cache).await?;
        let keys = self.store.keys(FAVORITES_NAMESPACE).await?;
        let loaded = self.favorites.load(&keys).await?;
        info!(entries = report.loaded, favorites = loaded, "Local state restored");
        Ok(report)
    }

    /// Flush the cache to disk before exit.
    pub async fn shutdown(&self) {
        let saved = self.snapshot.save_all(&self.cache).await;
        debug!(saved = saved, "Cache snapshot saved");
    }

    fn chain(&self, class: &str) -> Result<&Arc<FallbackChain<Payload>>> {
        self.chains
            .get(class)
            .ok_or_else(|| anyhow!("No sources configured for '{}'", class))
    }

    pub async fn resolve(&self, class: &str, key: &str) -> Result<Resolved<Payload>, FetchError> {
        match self.chains.get(class) {
            Some(chain) => self.coordinator.resolve(class, key, chain).await,
            None => Err(FetchError::NoFreshData {
                key: key.to_string(),
                attempts: Vec::new(),
            }),
        }
    }

    pub async fn refresh(&self, class: &str, key: &str) -> Result<Resolved<Payload>> {
        let chain = self.chain(class)?;
        Ok(self.coordinator.refresh(class, key, chain).await?)
    }

    /// Latest readings for several stations, in input order.
    pub async fn live(&self, keys: &[String]) -> Vec<(String, Result<Resolved<Payload>, FetchError>)> {
        let mut results: Vec<(usize, String, Result<Resolved<Payload>, FetchError>)> = stream::iter(keys.iter().enumerate())
            .map(|(i, key)| async move { (i, key.clone(), self.resolve(namespaces::LIVE_READING, key).await) })
            .buffer_unordered(MAX_CONCURRENT_REQUESTS)
            .collect()
            .await;
        results.sort_by_key(|(i, _, _)| *i);
        results.into_iter().map(|(_, key, result)| (key, result)).collect()
    }

    /// Historical and real-time series merged into one timeline.
    pub async fn timeline(&self, key: &str) -> Result<Reconciled> {
        let (historical, realtime) = futures::join!(
            self.resolve(namespaces::HISTORICAL_SERIES, key),
            self.resolve(namespaces::REALTIME_SERIES, key),
        );

        let historical = series_or_empty("historical", key, historical);
        let realtime = series_or_empty("real-time", key, realtime);
        if historical.is_empty() && realtime.is_empty() {
            return Err(anyhow!("No series data available for {}", key));
        }
        Ok(reconcile(&historical, &realtime, Utc::now().date_naive()))
    }

    pub fn toggle_favorite(&self, key: &str) -> bool {
        self.favorites.toggle(key)
    }

    pub fn favorites(&self) -> &MutationQueue {
        &self.favorites
    }

    pub fn cache(&self) -> &CacheStore<Payload> {
        &self.cache
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn invalidate(&self, class: &str, key: Option<&str>) {
        self.coordinator.invalidate(class, key).await;
    }
}

fn series_or_empty(
    label: &str,
    key: &str,
    result: Result<Resolved<Payload>, FetchError>,
) -> Vec<rivercache_core::TimelineRecord> {
    match result {
        Ok(resolved) => match resolved.value.as_series() {
            Some(series) => series.to_vec(),
            None => {
                warn!(key = key, series = label, "Cached value is not a series");
                Vec::new()
            }
        },
        Err(e) => {
            warn!(key = key, series = label, error = %e, "Series unavailable");
            Vec::new()
        }
    }
}
