//! Polling schedule policy.
//!
//! A pure function of a feed's recent activity. No store or clock access:
//! callers pass `now` in.

use chrono::{DateTime, Duration, Utc};

/// Interval after a manual refresh, in minutes.
pub const MANUAL_REFRESH_INTERVAL_MINUTES: i64 = 60;

/// Shortest interval between fetches, in minutes.
pub const MIN_INTERVAL_MINUTES: i64 = 60;

/// Longest interval between fetches, in minutes.
pub const MAX_INTERVAL_MINUTES: i64 = 1440;

/// Delay after a failed fetch, in minutes.
pub const FETCH_FAILURE_BACKOFF_MINUTES: i64 = MAX_INTERVAL_MINUTES;

/// Window constant used by the activity estimate, in days.
pub const ACTIVITY_WINDOW_DAYS: f64 = 30.0;

/// Cap on the empty-fetch streak used as a multiplier.
const MAX_EMPTY_STREAK: i64 = 3;

/// Base interval in minutes for an activity level.
fn base_interval_minutes(avg_items_per_day: f64) -> i64 {
    if avg_items_per_day > 10.0 {
        60
    } else if avg_items_per_day > 2.0 {
        180
    } else if avg_items_per_day > 0.5 {
        360
    } else {
        720
    }
}

/// Compute the polling interval in minutes.
pub fn next_interval_minutes(
    consecutive_empty_fetches: i64,
    avg_items_per_day: f64,
    was_manual_refresh: bool,
) -> i64 {
    if was_manual_refresh {
        return MANUAL_REFRESH_INTERVAL_MINUTES;
    }

    let streak = consecutive_empty_fetches.clamp(0, MAX_EMPTY_STREAK);
    let interval = base_interval_minutes(avg_items_per_day) * (1 + streak);
    interval.clamp(MIN_INTERVAL_MINUTES, MAX_INTERVAL_MINUTES)
}

/// Compute the absolute time of the next fetch.
pub fn next_fetch_at(
    now: DateTime<Utc>,
    consecutive_empty_fetches: i64,
    avg_items_per_day: f64,
    was_manual_refresh: bool,
) -> DateTime<Utc> {
    now + Duration::minutes(next_interval_minutes(
        consecutive_empty_fetches,
        avg_items_per_day,
        was_manual_refresh,
    ))
}

/// Time of the next attempt after a failed fetch.
pub fn failure_backoff_at(now: DateTime<Utc>) -> DateTime<Utc> {
    now + Duration::minutes(FETCH_FAILURE_BACKOFF_MINUTES)
}

/// Activity estimate from a feed's total stored item count.
///
/// Total count over a fixed window, not a rolling rate.
pub fn estimate_items_per_day(total_items: i64) -> f64 {
    total_items.max(0) as f64 / ACTIVITY_WINDOW_DAYS
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_busy_feed_polls_hourly() {
        assert_eq!(next_interval_minutes(0, 15.0, false), 60);
    }

    #[test]
    fn test_tier_boundaries() {
        assert_eq!(next_interval_minutes(0, 10.0, false), 180);
        assert_eq!(next_interval_minutes(0, 10.01, false), 60);
        assert_eq!(next_interval_minutes(0, 2.0, false), 360);
        assert_eq!(next_interval_minutes(0, 2.5, false), 180);
        assert_eq!(next_interval_minutes(0, 0.5, false), 720);
        assert_eq!(next_interval_minutes(0, 0.6, false), 360);
        assert_eq!(next_interval_minutes(0, 0.0, false), 720);
    }

    #[test]
    fn test_empty_streak_multiplies_and_clamps() {
        assert_eq!(next_interval_minutes(1, 15.0, false), 120);
        assert_eq!(next_interval_minutes(3, 15.0, false), 240);
        // Multiplier saturates at 4x
        assert_eq!(next_interval_minutes(10, 15.0, false), 240);
        // 360 * 4 = 1440, at the ceiling
        assert_eq!(next_interval_minutes(5, 1.0, false), 1440);
        // 720 * 2 = 1440
        assert_eq!(next_interval_minutes(1, 0.0, false), 1440);
        // 720 * 4 clamped
        assert_eq!(next_interval_minutes(3, 0.0, false), 1440);
    }

    #[test]
    fn test_negative_streak_treated_as_zero() {
        assert_eq!(next_interval_minutes(-4, 15.0, false), 60);
    }

    #[test]
    fn test_manual_refresh_overrides_everything() {
        assert_eq!(next_interval_minutes(0, 15.0, true), 60);
        assert_eq!(next_interval_minutes(5, 0.0, true), 60);
        assert_eq!(next_interval_minutes(2, 3.0, true), 60);
    }

    #[test]
    fn test_next_fetch_at_is_deterministic() {
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();
        let next = next_fetch_at(now, 0, 15.0, false);
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 15, 11, 0, 0).unwrap());
        assert_eq!(next_fetch_at(now, 0, 15.0, false), next);
    }

    #[test]
    fn test_failure_backoff() {
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();
        assert_eq!(
            failure_backoff_at(now),
            Utc.with_ymd_and_hms(2024, 1, 16, 10, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_estimate_items_per_day() {
        assert_eq!(estimate_items_per_day(0), 0.0);
        assert_eq!(estimate_items_per_day(30), 1.0);
        assert_eq!(estimate_items_per_day(450), 15.0);
        assert_eq!(estimate_items_per_day(-1), 0.0);
    }
}
