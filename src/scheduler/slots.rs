//! Weekly time slot arithmetic
//!
//! Slots are (weekday, seconds from local midnight) in the process time
//! zone, weekday 0 = Monday. Matching compares wall-clock seconds without
//! wrapping across midnight.

use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::models::TimeSlot;

/// Local weekday, 0 = Monday
pub fn local_weekday(local: &DateTime<Tz>) -> u8 {
    local.weekday().num_days_from_monday() as u8
}

/// Wall-clock seconds since local midnight
pub fn seconds_since_midnight(local: &DateTime<Tz>) -> u32 {
    local.num_seconds_from_midnight()
}

/// First slot of `slots` within `tolerance` of `now`, evaluated in `tz`
pub fn matching_slot(slots: &[TimeSlot], now: DateTime<Utc>, tz: Tz, tolerance: Duration) -> Option<TimeSlot> {
    let local = now.with_timezone(&tz);
    let today = local_weekday(&local);
    let secs = i64::from(seconds_since_midnight(&local));
    let tol = i64::try_from(tolerance.as_secs()).unwrap_or(i64::MAX);

    slots
        .iter()
        .filter(|s| s.weekday == today)
        .find(|s| (secs - i64::from(s.offset_secs)).abs() <= tol)
        .copied()
}

/// Concrete instants of `slots` from `now` up to `horizon_days` ahead,
/// ascending and without duplicates.
///
/// Local times skipped by a DST transition are left out; ambiguous ones
/// resolve to the earlier instant.
pub fn upcoming(slots: &[TimeSlot], now: DateTime<Utc>, tz: Tz, horizon_days: u32) -> Vec<DateTime<Tz>> {
    let local_now = now.with_timezone(&tz);
    let end = now + chrono::Duration::days(i64::from(horizon_days));
    let mut out = Vec::new();

    for day in 0..=horizon_days {
        let Some(date) = local_now
            .date_naive()
            .checked_add_days(chrono::Days::new(u64::from(day)))
        else {
            break;
        };
        let weekday = date.weekday().num_days_from_monday() as u8;

        for slot in slots.iter().filter(|s| s.weekday == weekday) {
            let Some(time) = NaiveTime::from_num_seconds_from_midnight_opt(slot.offset_secs, 0) else {
                continue;
            };
            let Some(at) = tz.from_local_datetime(&date.and_time(time)).earliest() else {
                continue;
            };
            if at >= local_now && at <= end {
                out.push(at);
            }
        }
    }

    out.sort();
    out.dedup();
    out
}
