//! Core library for rivercache.
//!
//! rivercache keeps volatile hydrometric data (live gauge readings, historical
//! and real-time series, forecasts) fresh without hammering unreliable
//! upstream services. The pieces, leaves first:
//!
//! - [`cache::CacheStore`]: namespaced TTL cache of whole-entry snapshots
//! - [`cache::SnapshotAdapter`]: mirrors cache namespaces into a [`store::DurableStore`]
//! - [`fetch::FallbackChain`]: ordered upstream sources with freshness validation
//! - [`coordinator::RequestCoordinator`]: single-flight fetches, per-key rate
//!   limiting and stale-while-revalidate on top of the cache
//! - [`timeline`]: merges historical and real-time series and reports the gap
//! - [`mutation::MutationQueue`]: optimistic, debounced favourite toggles with rollback

pub mod cache;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod fetch;
pub mod models;
pub mod mutation;
pub mod store;
pub mod timeline;
pub mod utils;

pub use cache::{CacheEntry, CacheStore, Freshness, NamespaceConfig, SnapshotAdapter};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use coordinator::{Origin, RateLimits, RequestCoordinator, Resolved};
pub use fetch::{
    Decoder, FallbackChain, FetchError, Fetcher, HttpFetcher, Source, TransportError, Validator,
};
pub use models::{Gap, LiveReading, Payload, SeriesSource, TimelineRecord, Timestamped};
pub use mutation::{MutationEvent, MutationQueue};
pub use store::{DurableStore, FileStore, MemoryStore, StoreError};
pub use timeline::{daily_means, reconcile, Reconciled};
