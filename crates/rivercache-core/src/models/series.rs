//! Daily series records and the gap between two series.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[cfg(feature = "ts")]
use ts_rs::TS;

use super::Timestamped;

/// Which feed a daily record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(TS), ts(export))]
#[serde(rename_all = "lowercase")]
pub enum SeriesSource {
    Historical,
    Realtime,
}

impl std::fmt::Display for SeriesSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SeriesSource::Historical => write!(f, "historical"),
            SeriesSource::Realtime => write!(f, "realtime"),
        }
    }
}

/// One day of a station's series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(TS), ts(export))]
pub struct TimelineRecord {
    #[cfg_attr(feature = "ts", ts(type = "string"))]
    pub date: NaiveDate,
    pub discharge: Option<f64>,
    pub level: Option<f64>,
    pub source: SeriesSource,
    /// Number of raw readings averaged into this record (real-time only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measurement_count: Option<u32>,
}

impl TimelineRecord {
    pub fn historical(date: NaiveDate, discharge: Option<f64>, level: Option<f64>) -> Self {
        Self {
            date,
            discharge,
            level,
            source: SeriesSource::Historical,
            measurement_count: None,
        }
    }

    pub fn realtime(date: NaiveDate, discharge: Option<f64>, level: Option<f64>) -> Self {
        Self {
            date,
            discharge,
            level,
            source: SeriesSource::Realtime,
            measurement_count: None,
        }
    }

    /// Number of populated measurement fields (0..=2).
    pub fn populated(&self) -> usize {
        usize::from(self.discharge.is_some()) + usize::from(self.level.is_some())
    }
}

impl Timestamped for Vec<TimelineRecord> {
    fn observed_at(&self) -> Option<DateTime<Utc>> {
        self.iter()
            .map(|r| r.date)
            .max()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc())
    }
}

/// A run of calendar days covered by neither feed.
///
/// `end` is inclusive. For an open-ended gap (no real-time data at all) `end`
/// is the caller-supplied current date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(TS), ts(export))]
pub struct Gap {
    #[cfg_attr(feature = "ts", ts(type = "string"))]
    pub start: NaiveDate,
    #[cfg_attr(feature = "ts", ts(type = "string"))]
    pub end: NaiveDate,
    pub open_ended: bool,
}

impl Gap {
    /// Uncovered days, counting both `start` and `end`.
    pub fn day_count(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    /// Days between the last record before the gap and the first one after it.
    pub fn span_days(&self) -> i64 {
        self.day_count() + 1
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

impl std::fmt::Display for Gap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.open_ended {
            write!(f, "{} onwards ({} days so far)", self.start, self.day_count())
        } else {
            write!(f, "{} to {} ({} days)", self.start, self.end, self.day_count())
        }
    }
}
