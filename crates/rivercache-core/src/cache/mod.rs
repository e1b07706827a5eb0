//! Local caching module.
//!
//! This module provides the `CacheStore` for holding upstream data in memory
//! and the `SnapshotAdapter` that mirrors it to durable storage so a restart
//! can serve last-known values before the network answers.
//!
//! Each namespace has its own TTL and grace window, e.g.:
//! - `live-reading`: minutes
//! - `historical-series`: hours
//! - `static-metadata`: days

pub mod snapshot;
pub mod store;

pub use snapshot::{LoadReport, SnapshotAdapter, DEFAULT_SNAPSHOT_NAMESPACE};
pub use store::{CacheEntry, CacheStore, Cached, Freshness, NamespaceConfig};
