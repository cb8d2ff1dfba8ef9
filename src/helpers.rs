//! Shared helpers for UTC day windows and numeric hygiene.
//!
//! The upstream serves reports per calendar day, so every fetch window is a
//! whole UTC day: `00:00:00` through `23:59:59`.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};

/// First and last second of a UTC calendar day.
pub(crate) fn day_bounds(date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN));
    (start, start + Duration::days(1) - Duration::seconds(1))
}

/// Whole UTC days touched by `[start, end]`, in ascending order.
///
/// Returns an empty list when `end` is before `start`.
pub(crate) fn utc_days(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    if end < start {
        return Vec::new();
    }
    let last = end.date_naive();
    let mut days = Vec::new();
    let mut date = start.date_naive();
    while date <= last {
        days.push(day_bounds(date));
        match date.succ_opt() {
            Some(next) => date = next,
            None => break,
        }
    }
    days
}

/// Drop NaN and infinite values.
pub(crate) fn finite(v: Option<f64>) -> Option<f64> {
    v.filter(|x| x.is_finite())
}
