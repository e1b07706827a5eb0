//! Application configuration management.
//!
//! Holds the freshness policy of every cache namespace, rate limits, the
//! debounce window for favourite toggles and the ordered upstream sources of
//! each data class. Missing fields take their defaults, so a partial file is
//! valid.
//!
//! Configuration is stored at `~/.config/rivercache/config.json`.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::cache::NamespaceConfig;
use crate::coordinator::RateLimits;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "rivercache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const DEFAULT_MIN_FETCH_INTERVAL_SECS: u64 = 30;
const DEFAULT_DEBOUNCE_MS: u64 = 500;
const DEFAULT_SOURCE_TIMEOUT_SECS: u64 = 10;
const MAX_SOURCE_TIMEOUT_SECS: u64 = 60;

/// Live readings older than this are rejected by the default sources.
const LIVE_MAX_AGE_SECS: u64 = 6 * 3600;

/// Well-known cache namespaces.
pub mod namespaces {
    pub const LIVE_READING: &str = "live-reading";
    pub const REALTIME_SERIES: &str = "realtime-series";
    pub const HISTORICAL_SERIES: &str = "historical-series";
    pub const FORECAST: &str = "forecast";
    pub const STATIC_METADATA: &str = "static-metadata";
}

/// Payload formats understood by the bundled decoders.
pub mod formats {
    /// Hourly CSV from the hydrometric data mart.
    pub const HYDROMETRIC_CSV: &str = "hydrometric-csv";
    /// GeoJSON feature collection of real-time readings; newest one is used.
    pub const REALTIME_GEOJSON: &str = "realtime-geojson";
    /// Same collection, aggregated to daily means.
    pub const REALTIME_DAILY_GEOJSON: &str = "realtime-daily-geojson";
    /// GeoJSON feature collection of published daily means.
    pub const DAILY_MEAN_GEOJSON: &str = "daily-mean-geojson";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceSettings {
    pub ttl_secs: u64,
    #[serde(default)]
    pub grace_secs: u64,
}

impl NamespaceSettings {
    pub fn new(ttl_secs: u64, grace_secs: u64) -> Self {
        Self { ttl_secs, grace_secs }
    }

    pub fn to_namespace_config(&self) -> NamespaceConfig {
        NamespaceConfig::new(Duration::from_secs(self.ttl_secs), Duration::from_secs(self.grace_secs))
    }
}

/// One upstream source in a data class's fallback order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSettings {
    pub tag: String,
    /// URL template; see [`crate::fetch::render_url`].
    pub url: String,
    /// Decoder to use for the response body.
    pub format: String,
    #[serde(default = "default_source_timeout")]
    pub timeout_secs: u64,
    /// Reject payloads whose newest observation is older than this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_secs: Option<u64>,
}

fn default_source_timeout() -> u64 {
    DEFAULT_SOURCE_TIMEOUT_SECS
}

impl SourceSettings {
    pub fn new(tag: impl Into<String>, url: impl Into<String>, format: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            url: url.into(),
            format: format.into(),
            timeout_secs: DEFAULT_SOURCE_TIMEOUT_SECS,
            max_age_secs: None,
        }
    }

    pub fn with_max_age(mut self, secs: u64) -> Self {
        self.max_age_secs = Some(secs);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub namespaces: BTreeMap<String, NamespaceSettings>,
    pub min_fetch_interval_secs: u64,
    /// Keyed by `"<namespace>"` or `"<namespace>/<key>"`.
    pub fetch_interval_overrides: BTreeMap<String, u64>,
    pub debounce_ms: u64,
    /// Ordered fallback sources per data class (keyed by namespace).
    pub sources: BTreeMap<String, Vec<SourceSettings>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        use namespaces::*;

        let namespaces = [
            (LIVE_READING, NamespaceSettings::new(5 * 60, 15 * 60)),
            (REALTIME_SERIES, NamespaceSettings::new(15 * 60, 3600)),
            (HISTORICAL_SERIES, NamespaceSettings::new(6 * 3600, 24 * 3600)),
            (FORECAST, NamespaceSettings::new(3600, 3 * 3600)),
            (STATIC_METADATA, NamespaceSettings::new(24 * 3600, 7 * 24 * 3600)),
        ]
        .into_iter()
        .map(|(name, settings)| (name.to_string(), settings))
        .collect();

        Self {
            namespaces,
            min_fetch_interval_secs: DEFAULT_MIN_FETCH_INTERVAL_SECS,
            fetch_interval_overrides: BTreeMap::new(),
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            sources: default_sources(),
            store_dir: None,
        }
    }
}

/// Keys are `<station>:<province>`, so `{0}` is the station number and `{1}`
/// the province code.
fn default_sources() -> BTreeMap<String, Vec<SourceSettings>> {
    use formats::*;
    use namespaces::*;

    let mut sources = BTreeMap::new();
    sources.insert(
        LIVE_READING.to_string(),
        vec![
            SourceSettings::new(
                "datamart-csv",
                "https://dd.weather.gc.ca/hydrometric/csv/{1}/hourly/{1}_{0}_hourly_hydrometric.csv",
                HYDROMETRIC_CSV,
            )
            .with_max_age(LIVE_MAX_AGE_SECS),
            SourceSettings::new(
                "realtime-api",
                "https://api.weather.gc.ca/collections/hydrometric-realtime/items?STATION_NUMBER={0}&limit=10&sortby=-DATETIME&f=json",
                REALTIME_GEOJSON,
            )
            .with_max_age(LIVE_MAX_AGE_SECS),
        ],
    );
    sources.insert(
        REALTIME_SERIES.to_string(),
        vec![SourceSettings::new(
            "realtime-api",
            "https://api.weather.gc.ca/collections/hydrometric-realtime/items?STATION_NUMBER={0}&limit=10000&sortby=DATETIME&f=json",
            REALTIME_DAILY_GEOJSON,
        )],
    );
    sources.insert(
        HISTORICAL_SERIES.to_string(),
        vec![SourceSettings::new(
            "daily-mean-api",
            "https://api.weather.gc.ca/collections/hydrometric-daily-mean/items?STATION_NUMBER={0}&limit=10000&sortby=-DATE&f=json",
            DAILY_MEAN_GEOJSON,
        )],
    );
    sources
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let config: Self = serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Root of the durable store.
    pub fn store_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.store_dir {
            return Ok(dir.clone());
        }
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn validate(&self) -> Result<()> {
        for (class, sources) in &self.sources {
            if sources.is_empty() {
                bail!("Data class '{}' has no sources", class);
            }
            let mut seen = HashSet::new();
            for source in sources {
                if source.tag.trim().is_empty() {
                    bail!("Data class '{}' has a source with an empty tag", class);
                }
                if source.url.trim().is_empty() {
                    bail!("Source '{}' in '{}' has an empty url", source.tag, class);
                }
                if !seen.insert(source.tag.as_str()) {
                    bail!("Duplicate source tag '{}' in '{}'", source.tag, class);
                }
                if !(1..=MAX_SOURCE_TIMEOUT_SECS).contains(&source.timeout_secs) {
                    bail!(
                        "Source '{}' in '{}' has timeout {}s, expected 1..={}s",
                        source.tag,
                        class,
                        source.timeout_secs,
                        MAX_SOURCE_TIMEOUT_SECS
                    );
                }
            }
        }
        Ok(())
    }

    /// `(name, policy)` pairs for [`crate::cache::CacheStore::new`].
    pub fn cache_namespaces(&self) -> Vec<(String, NamespaceConfig)> {
        self.namespaces
            .iter()
            .map(|(name, settings)| (name.clone(), settings.to_namespace_config()))
            .collect()
    }

    pub fn rate_limits(&self) -> RateLimits {
        self.fetch_interval_overrides.iter().fold(
            RateLimits::new(Duration::from_secs(self.min_fetch_interval_secs)),
            |limits, (scope, secs)| limits.with_override(scope.clone(), Duration::from_secs(*secs)),
        )
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn sources_for(&self, class: &str) -> &[SourceSettings] {
        self.sources.get(class).map(Vec::as_slice).unwrap_or(&[])
    }
}
