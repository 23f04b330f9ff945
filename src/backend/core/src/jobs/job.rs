//! Job record, status state machine, and retry/backoff policy.
//!
//! This module provides the core abstractions of the jobs service:
//!
//! - **Job**: the unit of schedulable work, persisted through the repository
//! - **JobStatus**: the lifecycle state machine with guarded transitions
//! - **BackoffStrategy**: retry delay computation with exponential backoff

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use super::recipient::Recipient;
use super::trigger::{truncate_millis, Trigger};
use crate::error::{PulseError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting for its fire time
    Scheduled,
    /// A dispatch attempt is in flight
    Executing,
    /// A transient failure occurred; waiting out the backoff delay
    Retry,
    /// All requested executions completed successfully
    Executed,
    /// Canceled before completion
    Canceled,
    /// Failed permanently (retries exhausted or fatal failure)
    Error,
}

impl JobStatus {
    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Executed | Self::Canceled | Self::Error)
    }

    /// Check if the job is eligible for the due-jobs poll.
    pub fn is_due_eligible(&self) -> bool {
        matches!(self, Self::Scheduled | Self::Retry)
    }

    /// Stable string form used in storage and API responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "SCHEDULED",
            Self::Executing => "EXECUTING",
            Self::Retry => "RETRY",
            Self::Executed => "EXECUTED",
            Self::Canceled => "CANCELED",
            Self::Error => "ERROR",
        }
    }

    /// Parse from the stable string form.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "SCHEDULED" => Ok(Self::Scheduled),
            "EXECUTING" => Ok(Self::Executing),
            "RETRY" => Ok(Self::Retry),
            "EXECUTED" => Ok(Self::Executed),
            "CANCELED" => Ok(Self::Canceled),
            "ERROR" => Ok(Self::Error),
            other => Err(PulseError::internal(format!("Unknown job status: {}", other))),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Correlation
// ═══════════════════════════════════════════════════════════════════════════════

/// Process/instance identifiers the job is attached to.
///
/// Jobs may be standalone, so every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobCorrelation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_process_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_process_instance_id: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff Strategy
// ═══════════════════════════════════════════════════════════════════════════════

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed { delay_secs: u64 },
    /// Linear increase in delay (delay * attempt)
    Linear {
        initial_delay_secs: u64,
        increment_secs: u64,
    },
    /// Exponential increase in delay (initial * multiplier^attempt), capped
    Exponential {
        initial_delay_secs: u64,
        max_delay_secs: u64,
        multiplier: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_delay_secs: 2,
            max_delay_secs: 300,
            multiplier: 2.0,
        }
    }
}

impl BackoffStrategy {
    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let secs = match self {
            Self::Fixed { delay_secs } => *delay_secs,
            Self::Linear {
                initial_delay_secs,
                increment_secs,
            } => initial_delay_secs + (increment_secs * attempt as u64),
            Self::Exponential {
                initial_delay_secs,
                max_delay_secs,
                multiplier,
            } => {
                let delay = (*initial_delay_secs as f64) * multiplier.powi(attempt as i32);
                delay.min(*max_delay_secs as f64) as u64
            }
        };

        Duration::from_secs(secs)
    }

    /// Create a fixed backoff strategy.
    pub fn fixed(delay_secs: u64) -> Self {
        Self::Fixed { delay_secs }
    }

    /// Create an exponential backoff strategy with sensible defaults.
    pub fn exponential() -> Self {
        Self::default()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job
// ═══════════════════════════════════════════════════════════════════════════════

/// Outcome of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job transitioned to CANCELED.
    Canceled,
    /// An attempt is in flight; the cancellation applies once it resolves.
    Deferred,
    /// The job was already terminal; canceling is a no-op.
    AlreadyTerminal,
}

/// The unit of schedulable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier, immutable after creation
    pub id: JobId,
    /// Process/instance correlation (jobs may be standalone)
    #[serde(default)]
    pub correlation: JobCorrelation,
    /// Immutable schedule rule
    pub trigger: Trigger,
    /// Delivery target
    pub recipient: Recipient,
    /// Current lifecycle status
    pub status: JobStatus,
    /// Execution attempts consumed for the current occurrence
    pub retries: u32,
    /// Retry budget per occurrence
    pub max_retries: u32,
    /// Retry delay policy
    #[serde(default)]
    pub backoff: BackoffStrategy,
    /// Deadline for a single dispatch attempt; global default applies when absent
    #[serde(default, with = "humantime_serde::option")]
    pub execution_timeout: Option<Duration>,
    /// Successful executions so far
    pub executions: u32,
    /// Cancellation requested while an attempt was in flight
    #[serde(default)]
    pub cancel_requested: bool,
    /// Next (or current) fire time, derived from the trigger
    pub fire_time: DateTime<Utc>,
    /// Creation instant
    pub created_at: DateTime<Utc>,
    /// Instant of the last state change
    pub last_update: DateTime<Utc>,
    /// Optimistic-concurrency version, bumped by every repository update
    #[serde(default)]
    pub version: i64,
}

impl Job {
    /// Create a new SCHEDULED job. The first fire time is computed from the
    /// trigger; the trigger and recipient must already be validated.
    pub fn new(
        trigger: Trigger,
        recipient: Recipient,
        correlation: JobCorrelation,
        max_retries: u32,
        backoff: BackoffStrategy,
        execution_timeout: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let now = truncate_millis(now);
        let fire_time = trigger.first_fire(now)?;

        Ok(Self {
            id: JobId::new(),
            correlation,
            trigger,
            recipient,
            status: JobStatus::Scheduled,
            retries: 0,
            max_retries,
            backoff,
            execution_timeout,
            executions: 0,
            cancel_requested: false,
            fire_time,
            created_at: now,
            last_update: now,
            version: 0,
        })
    }

    /// Whether the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the job is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status.is_due_eligible() && self.fire_time <= truncate_millis(now)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // State machine transitions
    // ─────────────────────────────────────────────────────────────────────────

    /// SCHEDULED|RETRY -> EXECUTING.
    ///
    /// Only the master performs this transition, and it is persisted with an
    /// optimistic version check: losing the check means another node claimed
    /// the job first.
    pub fn begin_execution(&mut self, now: DateTime<Utc>) -> Result<()> {
        if !self.status.is_due_eligible() {
            return Err(PulseError::invalid_transition(
                self.status,
                JobStatus::Executing,
            ));
        }
        self.status = JobStatus::Executing;
        self.touch(now);
        Ok(())
    }

    /// EXECUTING -> EXECUTED | SCHEDULED | CANCELED.
    ///
    /// A successful dispatch counts one execution. When the trigger has
    /// further occurrences the job is re-derived to SCHEDULED with a new,
    /// strictly later fire time and a reset retry budget; otherwise it is
    /// terminal EXECUTED. A deferred cancellation wins over rescheduling.
    pub fn complete_execution(&mut self, now: DateTime<Utc>) -> Result<JobStatus> {
        self.expect_executing(JobStatus::Executed)?;
        let now = truncate_millis(now);
        self.executions += 1;
        self.retries = 0;

        if self.cancel_requested {
            self.status = JobStatus::Canceled;
        } else {
            match self.trigger.next_fire(now, self.executions, Some(self.fire_time)) {
                Some(next) => {
                    self.fire_time = next;
                    self.status = JobStatus::Scheduled;
                }
                None => self.status = JobStatus::Executed,
            }
        }
        self.touch(now);
        Ok(self.status)
    }

    /// EXECUTING -> RETRY | ERROR | CANCELED, for a retryable failure.
    ///
    /// The retry budget is consumed one attempt at a time; exhaustion is
    /// terminal ERROR. A deferred cancellation wins over retrying.
    pub fn fail_attempt(&mut self, now: DateTime<Utc>) -> Result<JobStatus> {
        self.expect_executing(JobStatus::Retry)?;
        let now = truncate_millis(now);

        if self.cancel_requested {
            self.status = JobStatus::Canceled;
        } else if self.retries < self.max_retries {
            self.retries += 1;
            let delay = self.backoff.delay_for_attempt(self.retries);
            self.fire_time = truncate_millis(
                now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()),
            );
            self.status = JobStatus::Retry;
        } else {
            self.status = JobStatus::Error;
        }
        self.touch(now);
        Ok(self.status)
    }

    /// EXECUTING -> ERROR, for a failure classified non-retryable.
    pub fn fail_fatal(&mut self, now: DateTime<Utc>) -> Result<JobStatus> {
        self.expect_executing(JobStatus::Error)?;
        self.status = JobStatus::Error;
        self.touch(now);
        Ok(self.status)
    }

    /// Request cancellation.
    ///
    /// SCHEDULED|RETRY cancel immediately; EXECUTING defers until the
    /// in-flight attempt resolves; terminal states are a no-op.
    pub fn request_cancel(&mut self, now: DateTime<Utc>) -> CancelOutcome {
        match self.status {
            JobStatus::Scheduled | JobStatus::Retry => {
                self.status = JobStatus::Canceled;
                self.touch(now);
                CancelOutcome::Canceled
            }
            JobStatus::Executing => {
                self.cancel_requested = true;
                self.touch(now);
                CancelOutcome::Deferred
            }
            JobStatus::Executed | JobStatus::Canceled | JobStatus::Error => {
                CancelOutcome::AlreadyTerminal
            }
        }
    }

    /// Replace the trigger of a non-terminal job, recomputing the fire time
    /// and resetting the retry budget.
    pub fn reschedule(&mut self, trigger: Trigger, now: DateTime<Utc>) -> Result<()> {
        if self.is_terminal() {
            return Err(PulseError::new(
                crate::error::ErrorCode::JobTerminal,
                "Cannot reschedule a terminal job",
            ));
        }
        if self.status == JobStatus::Executing {
            return Err(PulseError::invalid_transition(
                self.status,
                JobStatus::Scheduled,
            ));
        }
        let now = truncate_millis(now);
        self.fire_time = trigger.first_fire(now)?;
        self.trigger = trigger;
        self.retries = 0;
        self.executions = 0;
        self.status = JobStatus::Scheduled;
        self.touch(now);
        Ok(())
    }

    fn expect_executing(&self, to: JobStatus) -> Result<()> {
        if self.status != JobStatus::Executing {
            return Err(PulseError::invalid_transition(self.status, to));
        }
        Ok(())
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.last_update = truncate_millis(now);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn http_recipient() -> Recipient {
        Recipient::Http {
            url: "https://example.com/cb".to_string(),
            method: "POST".to_string(),
            headers: HashMap::new(),
            payload: None,
        }
    }

    fn one_shot_job(max_retries: u32) -> Job {
        Job::new(
            Trigger::PointInTime { fire_time: at(2_000) },
            http_recipient(),
            JobCorrelation::default(),
            max_retries,
            BackoffStrategy::fixed(10),
            None,
            at(1_000),
        )
        .unwrap()
    }

    #[test]
    fn test_new_job_is_scheduled() {
        let job = one_shot_job(3);
        assert_eq!(job.status, JobStatus::Scheduled);
        assert_eq!(job.fire_time, at(2_000));
        assert_eq!(job.version, 0);
        assert!(job.fire_time >= job.created_at);
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobStatus::Executed.is_terminal());
        assert!(JobStatus::Canceled.is_terminal());
        assert!(JobStatus::Error.is_terminal());
        assert!(!JobStatus::Scheduled.is_terminal());
        assert!(!JobStatus::Retry.is_terminal());
    }

    #[test]
    fn test_one_shot_success_path() {
        let mut job = one_shot_job(3);
        job.begin_execution(at(2_000)).unwrap();
        assert_eq!(job.status, JobStatus::Executing);

        let status = job.complete_execution(at(2_001)).unwrap();
        assert_eq!(status, JobStatus::Executed);
        assert_eq!(job.executions, 1);
    }

    #[test]
    fn test_retry_path_and_exhaustion() {
        let mut job = one_shot_job(2);

        // Attempt 1 fails.
        job.begin_execution(at(2_000)).unwrap();
        assert_eq!(job.fail_attempt(at(2_001)).unwrap(), JobStatus::Retry);
        assert_eq!(job.retries, 1);
        assert_eq!(job.fire_time, at(2_011)); // now + fixed 10s backoff

        // Attempt 2 fails.
        job.begin_execution(at(2_011)).unwrap();
        assert_eq!(job.fail_attempt(at(2_012)).unwrap(), JobStatus::Retry);
        assert_eq!(job.retries, 2);

        // Attempt 3 fails: budget exhausted.
        job.begin_execution(at(2_022)).unwrap();
        assert_eq!(job.fail_attempt(at(2_023)).unwrap(), JobStatus::Error);
        assert_eq!(job.retries, 2);
        assert!(job.retries <= job.max_retries);
    }

    #[test]
    fn test_fatal_failure_skips_retry_budget() {
        let mut job = one_shot_job(5);
        job.begin_execution(at(2_000)).unwrap();
        assert_eq!(job.fail_fatal(at(2_001)).unwrap(), JobStatus::Error);
        assert_eq!(job.retries, 0);
    }

    #[test]
    fn test_recurring_job_reschedules_with_greater_fire_time() {
        let mut job = Job::new(
            Trigger::Interval {
                repeat_limit: 3,
                delay: Duration::from_secs(60),
            },
            http_recipient(),
            JobCorrelation::default(),
            0,
            BackoffStrategy::default(),
            None,
            at(1_000),
        )
        .unwrap();
        assert_eq!(job.fire_time, at(1_060));

        job.begin_execution(at(1_060)).unwrap();
        let status = job.complete_execution(at(1_060)).unwrap();
        assert_eq!(status, JobStatus::Scheduled);
        assert_eq!(job.executions, 1);
        assert!(job.fire_time > at(1_060));
        assert_eq!(job.fire_time, at(1_120));
    }

    #[test]
    fn test_repeat_limit_reached_is_terminal() {
        let mut job = Job::new(
            Trigger::Interval {
                repeat_limit: 1,
                delay: Duration::from_secs(60),
            },
            http_recipient(),
            JobCorrelation::default(),
            0,
            BackoffStrategy::default(),
            None,
            at(1_000),
        )
        .unwrap();

        job.begin_execution(at(1_060)).unwrap();
        assert_eq!(job.complete_execution(at(1_060)).unwrap(), JobStatus::Executed);
    }

    #[test]
    fn test_retries_reset_after_successful_fire() {
        let mut job = Job::new(
            Trigger::Interval {
                repeat_limit: 2,
                delay: Duration::from_secs(60),
            },
            http_recipient(),
            JobCorrelation::default(),
            3,
            BackoffStrategy::fixed(5),
            None,
            at(1_000),
        )
        .unwrap();

        job.begin_execution(at(1_060)).unwrap();
        job.fail_attempt(at(1_061)).unwrap();
        assert_eq!(job.retries, 1);

        job.begin_execution(at(1_066)).unwrap();
        assert_eq!(job.complete_execution(at(1_066)).unwrap(), JobStatus::Scheduled);
        assert_eq!(job.retries, 0);
    }

    #[test]
    fn test_cancel_scheduled() {
        let mut job = one_shot_job(0);
        assert_eq!(job.request_cancel(at(1_500)), CancelOutcome::Canceled);
        assert_eq!(job.status, JobStatus::Canceled);
    }

    #[test]
    fn test_cancel_executing_is_deferred() {
        let mut job = one_shot_job(3);
        job.begin_execution(at(2_000)).unwrap();

        assert_eq!(job.request_cancel(at(2_001)), CancelOutcome::Deferred);
        assert_eq!(job.status, JobStatus::Executing);
        assert!(job.cancel_requested);

        // Applied when the attempt resolves, even on success.
        assert_eq!(job.complete_execution(at(2_002)).unwrap(), JobStatus::Canceled);
    }

    #[test]
    fn test_cancel_deferred_wins_over_retry() {
        let mut job = one_shot_job(3);
        job.begin_execution(at(2_000)).unwrap();
        job.request_cancel(at(2_001));

        assert_eq!(job.fail_attempt(at(2_002)).unwrap(), JobStatus::Canceled);
    }

    #[test]
    fn test_cancel_terminal_is_noop() {
        let mut job = one_shot_job(0);
        job.begin_execution(at(2_000)).unwrap();
        job.complete_execution(at(2_001)).unwrap();

        assert_eq!(job.request_cancel(at(2_002)), CancelOutcome::AlreadyTerminal);
        assert_eq!(job.status, JobStatus::Executed);
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut job = one_shot_job(0);
        // Not executing yet.
        assert!(job.complete_execution(at(2_000)).is_err());
        assert!(job.fail_attempt(at(2_000)).is_err());

        job.begin_execution(at(2_000)).unwrap();
        // Already executing.
        assert!(job.begin_execution(at(2_000)).is_err());
    }

    #[test]
    fn test_reschedule_replaces_trigger() {
        let mut job = one_shot_job(2);
        job.reschedule(Trigger::PointInTime { fire_time: at(9_000) }, at(1_500))
            .unwrap();
        assert_eq!(job.fire_time, at(9_000));
        assert_eq!(job.status, JobStatus::Scheduled);

        job.begin_execution(at(9_000)).unwrap();
        job.complete_execution(at(9_001)).unwrap();
        assert!(job
            .reschedule(Trigger::PointInTime { fire_time: at(9_500) }, at(9_100))
            .is_err());
    }

    #[test]
    fn test_backoff_exponential_caps() {
        let backoff = BackoffStrategy::Exponential {
            initial_delay_secs: 1,
            max_delay_secs: 100,
            multiplier: 2.0,
        };
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(backoff.delay_for_attempt(10), Duration::from_secs(100));
    }

    #[test]
    fn test_backoff_linear() {
        let backoff = BackoffStrategy::Linear {
            initial_delay_secs: 5,
            increment_secs: 3,
        };
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_secs(5));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(11));
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            JobStatus::Scheduled,
            JobStatus::Executing,
            JobStatus::Retry,
            JobStatus::Executed,
            JobStatus::Canceled,
            JobStatus::Error,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(JobStatus::parse("BOGUS").is_err());
    }
}
