use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{LiveReading, TimelineRecord, Timestamped};

/// Value shape cached per namespace.
///
/// One cache instance serves every data class, so the stored value is an
/// enum over the shapes the decoders produce. `Document` carries payloads the
/// core does not interpret (forecasts, remote lists).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Reading(LiveReading),
    Readings(Vec<LiveReading>),
    Series(Vec<TimelineRecord>),
    Document {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        observed_at: Option<DateTime<Utc>>,
        body: serde_json::Value,
    },
}

impl Payload {
    pub fn as_reading(&self) -> Option<&LiveReading> {
        match self {
            Payload::Reading(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_readings(&self) -> Option<&[LiveReading]> {
        match self {
            Payload::Readings(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_series(&self) -> Option<&[TimelineRecord]> {
        match self {
            Payload::Series(s) => Some(s),
            _ => None,
        }
    }
}

impl Timestamped for Payload {
    fn observed_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Payload::Reading(r) => r.observed_at(),
            Payload::Readings(r) => r.observed_at(),
            Payload::Series(s) => s.observed_at(),
            Payload::Document { observed_at, .. } => *observed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_payload_json_shape() {
        let at = Utc.with_ymd_and_hms(2025, 10, 16, 12, 0, 0).unwrap();
        let payload = Payload::Reading(LiveReading::new("08NA011", at).with_discharge(8.43));
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "reading");
        assert_eq!(json["data"]["station_id"], "08NA011");

        let back: Payload = serde_json::from_value(json).unwrap();
        assert_eq!(back.observed_at(), Some(at));
    }

    #[test]
    fn test_empty_readings_have_no_timestamp() {
        let payload = Payload::Readings(Vec::new());
        assert_eq!(payload.observed_at(), None);
    }
}
