//! Payload decoders for the hydrometric endpoints.
//!
//! Keys have the form `<station>:<province>`; decoders only need the station.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;

use rivercache_core::config::formats;
use rivercache_core::fetch::{DecodeError, Decoder};
use rivercache_core::models::{LiveReading, Payload, TimelineRecord};
use rivercache_core::timeline::daily_means;

/// Decoders for every format the default configuration uses.
pub fn registry() -> HashMap<String, Arc<dyn Decoder<Payload>>> {
    let mut decoders: HashMap<String, Arc<dyn Decoder<Payload>>> = HashMap::new();
    decoders.insert(formats::HYDROMETRIC_CSV.to_string(), Arc::new(decode_hourly_csv));
    decoders.insert(formats::REALTIME_GEOJSON.to_string(), Arc::new(decode_latest_reading));
    decoders.insert(formats::REALTIME_DAILY_GEOJSON.to_string(), Arc::new(decode_realtime_daily));
    decoders.insert(formats::DAILY_MEAN_GEOJSON.to_string(), Arc::new(decode_daily_means));
    decoders
}

fn station_of(key: &str) -> &str {
    key.split(':').next().unwrap_or(key)
}

// ============================================================================
// Data mart CSV
// ============================================================================

/// Columns: ID, Date, Water Level (m), Grade, Symbol, QA/QC, Discharge (cms), ...
const CSV_DATE: usize = 1;
const CSV_LEVEL: usize = 2;
const CSV_DISCHARGE: usize = 6;

fn parse_measurement(field: Option<&str>) -> Option<f64> {
    let field = field?.trim();
    if field.is_empty() || field.eq_ignore_ascii_case("no data") {
        return None;
    }
    field.parse().ok()
}

/// Latest row carrying a discharge or level value.
fn decode_hourly_csv(key: &str, body: &[u8]) -> Result<Payload, DecodeError> {
    let text = std::str::from_utf8(body).map_err(|e| DecodeError::new(format!("CSV is not UTF-8: {}", e)))?;

    for line in text.lines().rev() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("ID") {
            continue;
        }
        let parts: Vec<&str> = line.split(',').collect();
        if parts.len() <= CSV_DISCHARGE {
            continue;
        }
        let Ok(observed_at) = DateTime::parse_from_rfc3339(parts[CSV_DATE].trim()) else {
            continue;
        };
        let reading = LiveReading {
            station_id: station_of(key).to_string(),
            observed_at: observed_at.with_timezone(&Utc),
            discharge: parse_measurement(parts.get(CSV_DISCHARGE).copied()),
            level: parse_measurement(parts.get(CSV_LEVEL).copied()),
        };
        if !reading.is_empty() {
            return Ok(Payload::Reading(reading));
        }
    }
    Err(DecodeError::new("CSV has no rows with measurements"))
}

// ============================================================================
// GeoJSON collections
// ============================================================================

#[derive(Deserialize)]
struct FeatureCollection<P> {
    #[serde(default = "Vec::new")]
    features: Vec<Feature<P>>,
}

#[derive(Deserialize)]
struct Feature<P> {
    properties: P,
}

#[derive(Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
struct RealtimeProperties {
    station_number: Option<String>,
    datetime: DateTime<Utc>,
    discharge: Option<f64>,
    level: Option<f64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
struct DailyMeanProperties {
    date: NaiveDate,
    discharge: Option<f64>,
    level: Option<f64>,
}

fn parse_collection<P: serde::de::DeserializeOwned>(body: &[u8]) -> Result<Vec<P>, DecodeError> {
    let collection: FeatureCollection<P> =
        serde_json::from_slice(body).map_err(|e| DecodeError::new(format!("Invalid GeoJSON: {}", e)))?;
    Ok(collection.features.into_iter().map(|f| f.properties).collect())
}

fn realtime_readings(key: &str, body: &[u8]) -> Result<Vec<LiveReading>, DecodeError> {
    let station = station_of(key);
    Ok(parse_collection::<RealtimeProperties>(body)?
        .into_iter()
        .map(|p| LiveReading {
            station_id: p.station_number.unwrap_or_else(|| station.to_string()),
            observed_at: p.datetime,
            discharge: p.discharge,
            level: p.level,
        })
        .filter(|r| !r.is_empty())
        .collect())
}

/// Newest reading in a real-time collection.
fn decode_latest_reading(key: &str, body: &[u8]) -> Result<Payload, DecodeError> {
    realtime_readings(key, body)?
        .into_iter()
        .max_by_key(|r| r.observed_at)
        .map(Payload::Reading)
        .ok_or_else(|| DecodeError::new("No real-time readings"))
}

/// Real-time readings averaged per day.
fn decode_realtime_daily(key: &str, body: &[u8]) -> Result<Payload, DecodeError> {
    let days = daily_means(&realtime_readings(key, body)?);
    if days.is_empty() {
        return Err(DecodeError::new("No real-time readings"));
    }
    Ok(Payload::Series(days))
}

fn decode_daily_means(_key: &str, body: &[u8]) -> Result<Payload, DecodeError> {
    let mut records: Vec<TimelineRecord> = parse_collection::<DailyMeanProperties>(body)?
        .into_iter()
        .filter(|p| p.discharge.is_some() || p.level.is_some())
        .map(|p| TimelineRecord::historical(p.date, p.discharge, p.level))
        .collect();
    if records.is_empty() {
        return Err(DecodeError::new("No daily means"));
    }
    records.sort_by_key(|r| r.date);
    Ok(Payload::Series(records))
}
