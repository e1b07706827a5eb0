use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::models::{Gap, TimelineRecord};

/// First and last date present in one input feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub first: NaiveDate,
    pub last: NaiveDate,
}

/// A merged timeline plus what it was built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reconciled {
    /// One record per date, ascending.
    pub records: Vec<TimelineRecord>,
    pub gap: Option<Gap>,
    pub historical_range: Option<DateRange>,
    pub realtime_range: Option<DateRange>,
}

impl Reconciled {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.records.first().map(|r| r.date)
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.records.last().map(|r| r.date)
    }
}

/// Merge two daily series.
///
/// The result has at most one record per date and is sorted ascending
/// whatever the input order. Where both feeds cover a date the real-time
/// record wins. The gap runs from the day after the last historical date to
/// the day before the first real-time date; when there is no real-time data
/// it is open-ended and runs to `today`.
pub fn reconcile(historical: &[TimelineRecord], realtime: &[TimelineRecord], today: NaiveDate) -> Reconciled {
    let historical_by_date = by_date(historical);
    let realtime_by_date = by_date(realtime);

    let historical_range = range_of(&historical_by_date);
    let realtime_range = range_of(&realtime_by_date);

    let mut merged = historical_by_date;
    merged.extend(realtime_by_date);

    Reconciled {
        records: merged.into_values().cloned().collect(),
        gap: find_gap(historical_range, realtime_range, today),
        historical_range,
        realtime_range,
    }
}

fn by_date(records: &[TimelineRecord]) -> BTreeMap<NaiveDate, &TimelineRecord> {
    let mut map: BTreeMap<NaiveDate, &TimelineRecord> = BTreeMap::new();
    for record in records {
        map.entry(record.date)
            .and_modify(|kept| {
                if prefer(record, *kept) == Ordering::Greater {
                    *kept = record;
                }
            })
            .or_insert(record);
    }
    map
}

/// Tie-break for two records of the same feed and date: more populated
/// fields, then larger discharge, then larger level.
fn prefer(a: &TimelineRecord, b: &TimelineRecord) -> Ordering {
    a.populated()
        .cmp(&b.populated())
        .then_with(|| cmp_measurement(a.discharge, b.discharge))
        .then_with(|| cmp_measurement(a.level, b.level))
}

fn cmp_measurement(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.total_cmp(&b),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

fn range_of(map: &BTreeMap<NaiveDate, &TimelineRecord>) -> Option<DateRange> {
    let first = *map.keys().next()?;
    let last = *map.keys().next_back()?;
    Some(DateRange { first, last })
}

fn find_gap(historical: Option<DateRange>, realtime: Option<DateRange>, today: NaiveDate) -> Option<Gap> {
    let start = historical?.last.checked_add_days(Days::new(1))?;
    match realtime {
        Some(realtime) => {
            let end = realtime.first.checked_sub_days(Days::new(1))?;
            (start <= end).then_some(Gap {
                start,
                end,
                open_ended: false,
            })
        }
        None => (start <= today).then_some(Gap {
            start,
            end: today,
            open_ended: true,
        }),
    }
}
