use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[cfg(feature = "ts")]
use ts_rs::TS;

/// Anything that knows when its data was observed upstream.
///
/// Freshness validators use this to reject payloads that decoded fine but
/// carry old measurements.
pub trait Timestamped {
    fn observed_at(&self) -> Option<DateTime<Utc>>;
}

/// A single gauge observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(TS), ts(export))]
pub struct LiveReading {
    pub station_id: String,
    #[cfg_attr(feature = "ts", ts(type = "string"))]
    pub observed_at: DateTime<Utc>,
    /// Discharge in m³/s.
    pub discharge: Option<f64>,
    /// Water level in metres.
    pub level: Option<f64>,
}

impl LiveReading {
    pub fn new(station_id: impl Into<String>, observed_at: DateTime<Utc>) -> Self {
        Self {
            station_id: station_id.into(),
            observed_at,
            discharge: None,
            level: None,
        }
    }

    pub fn with_discharge(mut self, discharge: f64) -> Self {
        self.discharge = Some(discharge);
        self
    }

    pub fn with_level(mut self, level: f64) -> Self {
        self.level = Some(level);
        self
    }

    /// True when the reading carries neither discharge nor level.
    pub fn is_empty(&self) -> bool {
        self.discharge.is_none() && self.level.is_none()
    }
}

impl Timestamped for LiveReading {
    fn observed_at(&self) -> Option<DateTime<Utc>> {
        Some(self.observed_at)
    }
}

impl Timestamped for Vec<LiveReading> {
    fn observed_at(&self) -> Option<DateTime<Utc>> {
        self.iter().map(|r| r.observed_at).max()
    }
}
