//! Data models for hydrometric data.
//!
//! This module contains the data structures the cache and coordinator
//! carry around:
//!
//! - `LiveReading`: one gauge observation (discharge and/or water level)
//! - `TimelineRecord`, `SeriesSource`, `Gap`: daily series and reconciliation output
//! - `Payload`: the opaque value shape stored per cache namespace

pub mod payload;
pub mod reading;
pub mod series;

pub use payload::Payload;
pub use reading::{LiveReading, Timestamped};
pub use series::{Gap, SeriesSource, TimelineRecord};
