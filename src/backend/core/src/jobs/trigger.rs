//! Trigger definitions and next-fire-time computation.
//!
//! A trigger is the immutable rule describing *when* a job fires: once at a
//! point in time, on a repeating interval, or on a cron expression. The
//! mutable "next fire time" on the job record is always derived from the
//! trigger through [`Trigger::next_fire`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ErrorCode, PulseError, Result};

/// Truncate a timestamp to millisecond precision.
///
/// All fire times and heartbeats are stored and compared in UTC with
/// millisecond truncation, so that values survive a round trip through any
/// storage backend unchanged.
pub fn truncate_millis(t: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(t.timestamp_millis()).unwrap_or(t)
}

/// Schedule rule for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Fire exactly once at the given instant.
    PointInTime { fire_time: DateTime<Utc> },

    /// Fire every `delay`, up to `repeat_limit` total executions.
    /// A `repeat_limit` of zero or less means unlimited.
    Interval {
        repeat_limit: i32,
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },

    /// Fire on every occurrence of a cron expression, evaluated in UTC.
    Cron { expression: String },
}

impl Trigger {
    /// Validate the trigger definition at job-creation time.
    ///
    /// A malformed schedule is a configuration error: the job is rejected
    /// synchronously and never persisted.
    pub fn validate(&self) -> Result<()> {
        match self {
            Trigger::PointInTime { .. } => Ok(()),
            Trigger::Interval { delay, .. } => {
                if delay.is_zero() {
                    return Err(PulseError::new(
                        ErrorCode::InvalidTrigger,
                        "Interval delay must be greater than zero",
                    ));
                }
                Ok(())
            }
            Trigger::Cron { expression } => {
                cron::Schedule::from_str(expression).map_err(|e| {
                    PulseError::with_internal(
                        ErrorCode::InvalidCronExpression,
                        format!("Invalid cron expression: {}", expression),
                        e.to_string(),
                    )
                })?;
                Ok(())
            }
        }
    }

    /// Compute the first fire time for a freshly created job.
    ///
    /// A point-in-time instant already in the past is clamped to `now`: the
    /// job fires on the next poll instead of being rejected or skipped.
    pub fn first_fire(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let now = truncate_millis(now);
        match self {
            Trigger::PointInTime { fire_time } => Ok(truncate_millis(*fire_time).max(now)),
            Trigger::Interval { .. } | Trigger::Cron { .. } => self
                .next_fire(now, 0, None)
                .ok_or_else(|| {
                    PulseError::new(
                        ErrorCode::InvalidTrigger,
                        "Trigger produces no future occurrence",
                    )
                }),
        }
    }

    /// Compute the next fire time, or `None` when the trigger is exhausted.
    ///
    /// `executions` is the number of successful executions so far and
    /// `last_fire` the instant of the most recent one. A computed time in the
    /// past (the scheduler was down) collapses to `now`: the job fires once
    /// immediately, missed occurrences are not replayed.
    pub fn next_fire(
        &self,
        now: DateTime<Utc>,
        executions: u32,
        last_fire: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        let now = truncate_millis(now);
        match self {
            Trigger::PointInTime { fire_time } => {
                if executions == 0 {
                    Some(truncate_millis(*fire_time).max(now))
                } else {
                    None
                }
            }
            Trigger::Interval {
                repeat_limit,
                delay,
            } => {
                if *repeat_limit > 0 && executions >= *repeat_limit as u32 {
                    return None;
                }
                let delay = chrono::Duration::from_std(*delay).ok()?;
                let next = match last_fire {
                    Some(last) => truncate_millis(last) + delay,
                    None => now + delay,
                };
                Some(truncate_millis(next).max(now))
            }
            Trigger::Cron { expression } => {
                let schedule = cron::Schedule::from_str(expression).ok()?;
                schedule.after(&now).next().map(truncate_millis)
            }
        }
    }

    /// Whether this trigger can fire more than once.
    pub fn is_recurring(&self) -> bool {
        match self {
            Trigger::PointInTime { .. } => false,
            Trigger::Interval { repeat_limit, .. } => *repeat_limit != 1,
            Trigger::Cron { .. } => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_truncate_millis() {
        let t = Utc.timestamp_opt(1_000, 123_456_789).unwrap();
        let truncated = truncate_millis(t);
        assert_eq!(truncated.timestamp_millis(), t.timestamp_millis());
        assert_eq!(truncated.timestamp_subsec_micros() % 1000, 0);
    }

    #[test]
    fn test_point_in_time_fires_once() {
        let trigger = Trigger::PointInTime { fire_time: at(2_000) };
        let now = at(1_000);

        assert_eq!(trigger.next_fire(now, 0, None), Some(at(2_000)));
        assert_eq!(trigger.next_fire(now, 1, Some(at(2_000))), None);
    }

    #[test]
    fn test_point_in_time_in_past_fires_immediately() {
        let trigger = Trigger::PointInTime { fire_time: at(500) };
        let now = at(1_000);

        // Honored on the next poll, not skipped.
        assert_eq!(trigger.next_fire(now, 0, None), Some(now));
        assert_eq!(trigger.first_fire(now).unwrap(), now);
    }

    #[test]
    fn test_interval_advances_from_last_fire() {
        let trigger = Trigger::Interval {
            repeat_limit: 0,
            delay: Duration::from_secs(60),
        };
        let now = at(1_000);

        assert_eq!(trigger.next_fire(now, 0, None), Some(at(1_060)));
        assert_eq!(trigger.next_fire(now, 1, Some(at(1_060))), Some(at(1_120)));
    }

    #[test]
    fn test_interval_repeat_limit_exhaustion() {
        let trigger = Trigger::Interval {
            repeat_limit: 3,
            delay: Duration::from_secs(10),
        };
        let now = at(1_000);

        assert!(trigger.next_fire(now, 2, Some(at(990))).is_some());
        assert_eq!(trigger.next_fire(now, 3, Some(at(1_000))), None);
        assert_eq!(trigger.next_fire(now, 4, Some(at(1_000))), None);
    }

    #[test]
    fn test_interval_no_catchup_storm() {
        let trigger = Trigger::Interval {
            repeat_limit: 0,
            delay: Duration::from_secs(10),
        };
        // Scheduler was down: last fire long in the past. One immediate
        // fire, no replay of missed occurrences.
        let now = at(10_000);
        assert_eq!(trigger.next_fire(now, 5, Some(at(1_000))), Some(now));
    }

    #[test]
    fn test_cron_next_occurrence_strictly_after_now() {
        // Every minute at second zero.
        let trigger = Trigger::Cron {
            expression: "0 * * * * *".to_string(),
        };
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();

        let next = trigger.next_fire(now, 0, None).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 12, 1, 0).unwrap());
        assert!(next > now);
    }

    #[test]
    fn test_determinism() {
        let now = at(5_000);
        let triggers = vec![
            Trigger::PointInTime { fire_time: at(6_000) },
            Trigger::Interval {
                repeat_limit: 5,
                delay: Duration::from_secs(30),
            },
            Trigger::Cron {
                expression: "0 0 * * * *".to_string(),
            },
        ];

        for trigger in triggers {
            let a = trigger.next_fire(now, 1, Some(at(4_000)));
            let b = trigger.next_fire(now, 1, Some(at(4_000)));
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_validate_rejects_malformed_cron() {
        let trigger = Trigger::Cron {
            expression: "not a cron".to_string(),
        };
        let err = trigger.validate().unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidCronExpression);
    }

    #[test]
    fn test_validate_rejects_zero_delay() {
        let trigger = Trigger::Interval {
            repeat_limit: 1,
            delay: Duration::ZERO,
        };
        assert_eq!(
            trigger.validate().unwrap_err().code(),
            ErrorCode::InvalidTrigger
        );
    }

    #[test]
    fn test_is_recurring() {
        assert!(!Trigger::PointInTime { fire_time: at(0) }.is_recurring());
        assert!(Trigger::Interval {
            repeat_limit: 0,
            delay: Duration::from_secs(1)
        }
        .is_recurring());
        assert!(!Trigger::Interval {
            repeat_limit: 1,
            delay: Duration::from_secs(1)
        }
        .is_recurring());
    }

    #[test]
    fn test_serde_round_trip() {
        let trigger = Trigger::Interval {
            repeat_limit: 3,
            delay: Duration::from_secs(90),
        };
        let json = serde_json::to_string(&trigger).unwrap();
        let back: Trigger = serde_json::from_str(&json).unwrap();
        assert_eq!(trigger, back);
    }
}
