//! Time scopes for query filtering.
//!
//! Query-facing scopes resolve against the *local* clock (a query for
//! "today" at 23:59 means the current local day), while tier windows and
//! archive buckets stay UTC-stable.

use serde::{Deserialize, Serialize};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Time scope for queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeScope {
    /// The current local calendar day.
    Today,
    /// Rolling 7 days.
    LastWeek,
    /// Rolling 30 days.
    LastMonth,
    /// Rolling 90 days.
    LastQuarter,
    /// No time bound.
    AllTime,
    /// Explicit `[start, end]` range in Unix milliseconds.
    Range(i64, i64),
}

impl TimeScope {
    /// Resolves to a `[start, end]` millisecond range.
    ///
    /// `now_ms` anchors the rolling scopes; `Today` snaps to local-midnight
    /// boundaries.
    pub fn to_range(&self, now_ms: i64) -> (i64, i64) {
        match self {
            TimeScope::Today => local_day_bounds(now_ms),
            TimeScope::LastWeek => (now_ms - 7 * DAY_MS, now_ms),
            TimeScope::LastMonth => (now_ms - 30 * DAY_MS, now_ms),
            TimeScope::LastQuarter => (now_ms - 90 * DAY_MS, now_ms),
            TimeScope::AllTime => (0, i64::MAX),
            TimeScope::Range(start, end) => (*start, *end),
        }
    }

    /// Whether a timestamp falls inside this scope.
    pub fn contains(&self, timestamp_ms: i64, now_ms: i64) -> bool {
        let (start, end) = self.to_range(now_ms);
        timestamp_ms >= start && timestamp_ms <= end
    }
}

/// `[local midnight, next local midnight)` around `now_ms`.
fn local_day_bounds(now_ms: i64) -> (i64, i64) {
    use chrono::{DateTime, Local, TimeZone, Utc};

    let Some(now_utc) = DateTime::<Utc>::from_timestamp_millis(now_ms) else {
        return (now_ms - DAY_MS, now_ms);
    };
    let local = now_utc.with_timezone(&Local);
    let Some(midnight) = local.date_naive().and_hms_opt(0, 0, 0) else {
        return (now_ms - DAY_MS, now_ms);
    };
    match Local.from_local_datetime(&midnight).single() {
        Some(start) => {
            let start_ms = start.timestamp_millis();
            (start_ms, start_ms + DAY_MS - 1)
        }
        None => (now_ms - DAY_MS, now_ms),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rolling_scopes() {
        let now = 100 * DAY_MS;
        assert_eq!(TimeScope::LastWeek.to_range(now), (93 * DAY_MS, now));
        assert_eq!(TimeScope::LastMonth.to_range(now), (70 * DAY_MS, now));
        assert_eq!(TimeScope::AllTime.to_range(now), (0, i64::MAX));
        assert_eq!(TimeScope::Range(5, 9).to_range(now), (5, 9));
    }

    #[test]
    fn test_today_is_a_single_local_day() {
        let now = common::now_ms();
        let (start, end) = TimeScope::Today.to_range(now);
        assert!(start <= now && now <= end);
        assert_eq!(end - start, DAY_MS - 1);
    }

    #[test]
    fn test_contains() {
        let now = 100 * DAY_MS;
        assert!(TimeScope::LastWeek.contains(95 * DAY_MS, now));
        assert!(!TimeScope::LastWeek.contains(80 * DAY_MS, now));
        assert!(TimeScope::AllTime.contains(0, now));
    }
}
