use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;

use super::error::{Result, SchedulerError};

/// Cron next-fire calculation behind a trait so the governor stays pure
/// and tests can pin fire times.
pub trait Cron: Send + Sync {
    /// The first fire time strictly after `after`.
    fn next_fire(&self, expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>>;
}

/// `cron::Schedule`-backed implementation. Users write conventional
/// five-field expressions; the crate wants a seconds column, so a
/// five-field input gains a `"0 "` prefix before parsing.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardCron;

impl StandardCron {
    fn normalize(expression: &str) -> String {
        let fields = expression.split_whitespace().count();
        if fields == 5 {
            format!("0 {expression}")
        } else {
            expression.to_string()
        }
    }

    fn parse(expression: &str) -> Result<Schedule> {
        let normalized = Self::normalize(expression);
        Schedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidCron {
            expression: expression.to_string(),
            reason: e.to_string(),
        })
    }

    /// Parse-only check used when endpoints are created.
    pub fn validate(expression: &str) -> Result<()> {
        Self::parse(expression).map(|_| ())
    }
}

impl Cron for StandardCron {
    fn next_fire(&self, expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let schedule = Self::parse(expression)?;
        schedule
            .after(&after)
            .next()
            .ok_or_else(|| SchedulerError::InvalidCron {
                expression: expression.to_string(),
                reason: "no upcoming fire time".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn five_field_expressions_are_normalized() {
        let after = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 30).unwrap();
        let next = StandardCron.next_fire("*/5 * * * *", after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 1, 1, 0, 5, 0).unwrap());
    }

    #[test]
    fn six_field_expressions_pass_through() {
        let after = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let next = StandardCron.next_fire("30 * * * * *", after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 30).unwrap());
    }

    #[test]
    fn next_fire_is_strictly_after() {
        let on_the_minute = Utc.with_ymd_and_hms(2025, 1, 1, 0, 5, 0).unwrap();
        let next = StandardCron.next_fire("*/5 * * * *", on_the_minute).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 1, 1, 0, 10, 0).unwrap());
    }

    #[test]
    fn invalid_expressions_are_rejected() {
        assert!(StandardCron::validate("not a cron").is_err());
        assert!(StandardCron::validate("61 * * * *").is_err());
        assert!(StandardCron::validate("0 9 * * 1-5").is_ok());
    }
}
