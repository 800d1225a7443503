//! # Detection Schedule
//!
//! Five-field cron matching (minute, hour, day-of-month, month, day-of-week)
//! for the preferred-host schedule trigger. Matching is delegated to `croner`;
//! this module only pins the expression to minute granularity and adds the
//! guard that keeps a sub-second poll from firing twice in the same minute.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Local, TimeZone, Timelike};
use croner::Cron;

use crate::error::PolicyError;

#[derive(Clone)]
pub struct DetectionSchedule {
    expression: String,
    cron: Arc<Cron>,
}

impl DetectionSchedule {
    pub fn parse(expression: &str) -> Result<Self, PolicyError> {
        let expression = expression.trim();
        let fields = expression.split_whitespace().count();
        if fields != 5 {
            return Err(PolicyError::InvalidSchedule {
                schedule: expression.to_string(),
                reason: format!("expected 5 fields (minute hour day month weekday), found {}", fields),
            });
        }

        let cron = Cron::new(expression).parse().map_err(|e| PolicyError::InvalidSchedule {
            schedule: expression.to_string(),
            reason: format!("{:?}", e),
        })?;

        Ok(Self { expression: expression.to_string(), cron: Arc::new(cron) })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// True when the minute containing `instant` matches the expression.
    pub fn matches<Tz: TimeZone>(&self, instant: &DateTime<Tz>) -> bool {
        let minute = instant.with_second(0).and_then(|t| t.with_nanosecond(0));
        match minute {
            Some(minute) => self.cron.is_time_matching(&minute).unwrap_or(false),
            None => false,
        }
    }
}

impl PartialEq for DetectionSchedule {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

impl fmt::Debug for DetectionSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DetectionSchedule").field(&self.expression).finish()
    }
}

/// Wall-clock source the schedule is matched against.
pub type WallClock = Arc<dyn Fn() -> DateTime<Local> + Send + Sync>;

pub fn system_clock() -> WallClock {
    Arc::new(Local::now)
}

/// Remembers the last minute a schedule fired in.
#[derive(Debug, Default)]
pub struct MinuteGuard {
    last_fired: Option<i64>,
}

impl MinuteGuard {
    /// Returns true at most once per matching minute.
    pub fn should_fire<Tz: TimeZone>(&mut self, schedule: &DetectionSchedule, now: &DateTime<Tz>) -> bool {
        let minute = now.timestamp().div_euclid(60);
        if self.last_fired == Some(minute) || !schedule.matches(now) {
            return false;
        }
        self.last_fired = Some(minute);
        true
    }

    pub fn reset(&mut self) {
        self.last_fired = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, h, m, s).unwrap()
    }

    #[test]
    fn test_rejects_wrong_field_count() {
        assert!(DetectionSchedule::parse("* * * *").is_err());
        assert!(DetectionSchedule::parse("0 * * * * *").is_err());
        assert!(DetectionSchedule::parse("").is_err());
    }

    #[test]
    fn test_rejects_garbage() {
        let err = DetectionSchedule::parse("61 * * * *").unwrap_err();
        assert!(matches!(err, PolicyError::InvalidSchedule { .. }));
    }

    #[test]
    fn test_matches_whole_minute() {
        let schedule = DetectionSchedule::parse("*/15 * * * *").unwrap();
        assert!(schedule.matches(&at(10, 15, 0)));
        assert!(schedule.matches(&at(10, 15, 42)));
        assert!(!schedule.matches(&at(10, 16, 0)));
    }

    #[test]
    fn test_matches_hour_and_weekday() {
        // 2024-03-04 is a Monday
        let schedule = DetectionSchedule::parse("30 9 * * 1").unwrap();
        assert!(schedule.matches(&at(9, 30, 5)));
        assert!(!schedule.matches(&at(10, 30, 5)));
    }

    #[test]
    fn test_guard_fires_once_per_minute() {
        let schedule = DetectionSchedule::parse("* * * * *").unwrap();
        let mut guard = MinuteGuard::default();

        assert!(guard.should_fire(&schedule, &at(8, 0, 0)));
        assert!(!guard.should_fire(&schedule, &at(8, 0, 1)));
        assert!(!guard.should_fire(&schedule, &at(8, 0, 59)));
        assert!(guard.should_fire(&schedule, &at(8, 1, 0)));
    }

    #[test]
    fn test_guard_ignores_non_matching_minutes() {
        let schedule = DetectionSchedule::parse("5 * * * *").unwrap();
        let mut guard = MinuteGuard::default();
        assert!(!guard.should_fire(&schedule, &at(8, 4, 59)));
        assert!(guard.should_fire(&schedule, &at(8, 5, 0)));
        guard.reset();
        assert!(guard.should_fire(&schedule, &at(8, 5, 30)));
    }
}
