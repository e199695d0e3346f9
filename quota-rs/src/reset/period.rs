//! Period boundary arithmetic
//!
//! A tenant period starts at 00:00 UTC on the anchor day of a month.
//! Anchor days are restricted to 1-28 so every month has one; any other
//! anchor yields `None`.

use chrono::{DateTime, Datelike, NaiveDate, Utc};

fn anchor_in_month(year: i32, month: u32, anchor_day: u32) -> Option<DateTime<Utc>> {
    if !(1..=28).contains(&anchor_day) {
        return None;
    }
    NaiveDate::from_ymd_opt(year, month, anchor_day)?
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
}

fn previous_month(year: i32, month: u32) -> (i32, u32) {
    if month == 1 {
        (year - 1, 12)
    } else {
        (year, month - 1)
    }
}

fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}

/// Most recent period boundary at or before `now`
pub fn current_period_start(anchor_day: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let this_month = anchor_in_month(now.year(), now.month(), anchor_day)?;
    if this_month <= now {
        return Some(this_month);
    }
    let (year, month) = previous_month(now.year(), now.month());
    anchor_in_month(year, month, anchor_day)
}

/// First period boundary strictly after `now`
pub fn next_period_start(anchor_day: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let start = current_period_start(anchor_day, now)?;
    let (year, month) = next_month(start.year(), start.month());
    anchor_in_month(year, month, anchor_day)
}

/// Number of period boundaries in `(last_reset_at, now]`
pub fn periods_elapsed(
    anchor_day: u32,
    last_reset_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<u32> {
    let mut boundary = current_period_start(anchor_day, now)?;
    let mut count = 0;
    while boundary > last_reset_at {
        count += 1;
        let (year, month) = previous_month(boundary.year(), boundary.month());
        boundary = anchor_in_month(year, month, anchor_day)?;
    }
    Some(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn test_current_period_start_after_anchor() {
        assert_eq!(current_period_start(15, at(2024, 6, 20, 8)), Some(at(2024, 6, 15, 0)));
    }

    #[test]
    fn test_current_period_start_before_anchor() {
        assert_eq!(current_period_start(15, at(2024, 6, 3, 8)), Some(at(2024, 5, 15, 0)));
        assert_eq!(current_period_start(5, at(2024, 1, 2, 8)), Some(at(2023, 12, 5, 0)));
    }

    #[test]
    fn test_current_period_start_on_anchor_day() {
        assert_eq!(current_period_start(1, at(2024, 3, 1, 0)), Some(at(2024, 3, 1, 0)));
    }

    #[test]
    fn test_invalid_anchor() {
        assert_eq!(current_period_start(0, at(2024, 3, 1, 0)), None);
        assert_eq!(current_period_start(31, at(2024, 3, 1, 0)), None);
    }

    #[test]
    fn test_next_period_start_wraps_year() {
        assert_eq!(next_period_start(10, at(2024, 12, 11, 0)), Some(at(2025, 1, 10, 0)));
    }

    #[test]
    fn test_periods_elapsed() {
        // Reset on Feb 2, now Feb 20: no boundary crossed
        assert_eq!(periods_elapsed(1, at(2024, 2, 2, 0), at(2024, 2, 20, 0)), Some(0));
        // Scheduler down from mid-January to mid-April: Feb 1, Mar 1, Apr 1
        assert_eq!(periods_elapsed(1, at(2024, 1, 15, 0), at(2024, 4, 15, 0)), Some(3));
    }
}
