use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::models::{LiveReading, TimelineRecord};

/// Collapse sub-daily readings into one real-time record per UTC day.
///
/// Discharge and level are averaged independently over the readings that
/// carry them; discharge is rounded to 2 decimals and level to 3. Days where
/// neither could be computed are dropped.
pub fn daily_means(readings: &[LiveReading]) -> Vec<TimelineRecord> {
    let mut days: BTreeMap<NaiveDate, DayAccumulator> = BTreeMap::new();
    for reading in readings {
        days.entry(reading.observed_at.date_naive())
            .or_default()
            .add(reading);
    }

    days.into_iter()
        .filter_map(|(date, acc)| acc.finish(date))
        .collect()
}

#[derive(Default)]
struct DayAccumulator {
    discharge_sum: f64,
    discharge_n: u32,
    level_sum: f64,
    level_n: u32,
    readings: u32,
}

impl DayAccumulator {
    fn add(&mut self, reading: &LiveReading) {
        self.readings += 1;
        if let Some(q) = reading.discharge {
            self.discharge_sum += q;
            self.discharge_n += 1;
        }
        if let Some(h) = reading.level {
            self.level_sum += h;
            self.level_n += 1;
        }
    }

    fn finish(self, date: NaiveDate) -> Option<TimelineRecord> {
        let discharge = mean(self.discharge_sum, self.discharge_n).map(|q| round_to(q, 2));
        let level = mean(self.level_sum, self.level_n).map(|h| round_to(h, 3));
        if discharge.is_none() && level.is_none() {
            return None;
        }
        let mut record = TimelineRecord::realtime(date, discharge, level);
        record.measurement_count = Some(self.readings);
        Some(record)
    }
}

fn mean(sum: f64, n: u32) -> Option<f64> {
    (n > 0).then(|| sum / f64::from(n))
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SeriesSource;
    use chrono::{TimeZone, Utc};

    fn reading(d: u32, h: u32, discharge: Option<f64>, level: Option<f64>) -> LiveReading {
        LiveReading {
            station_id: "08NA011".to_string(),
            observed_at: Utc.with_ymd_and_hms(2025, 9, d, h, 0, 0).unwrap(),
            discharge,
            level,
        }
    }

    #[test]
    fn test_daily_means_groups_by_utc_day() {
        let readings = vec![
            reading(16, 0, Some(8.0), Some(1.2)),
            reading(16, 12, Some(9.0), None),
            reading(16, 23, Some(10.0), Some(1.3)),
            reading(17, 1, Some(7.123), Some(1.0004)),
        ];

        let days = daily_means(&readings);
        assert_eq!(days.len(), 2);

        assert_eq!(days[0].date, NaiveDate::from_ymd_opt(2025, 9, 16).unwrap());
        assert_eq!(days[0].discharge, Some(9.0));
        assert_eq!(days[0].level, Some(1.25));
        assert_eq!(days[0].measurement_count, Some(3));
        assert_eq!(days[0].source, SeriesSource::Realtime);

        assert_eq!(days[1].discharge, Some(7.12));
        assert_eq!(days[1].level, Some(1.0));
    }

    #[test]
    fn test_daily_means_drops_empty_days_and_sorts() {
        let readings = vec![
            reading(18, 6, Some(3.0), None),
            reading(17, 6, None, None),
            reading(16, 6, None, Some(0.5)),
        ];
        let days = daily_means(&readings);
        let dates: Vec<u32> = days.iter().map(|r| chrono::Datelike::day(&r.date)).collect();
        assert_eq!(dates, vec![16, 18]);
        assert_eq!(days[0].discharge, None);
        assert_eq!(days[0].level, Some(0.5));
    }

    #[test]
    fn test_daily_means_empty_input() {
        assert!(daily_means(&[]).is_empty());
    }
}
