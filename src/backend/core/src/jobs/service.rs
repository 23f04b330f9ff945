//! Job creation and cancellation service.
//!
//! Single entry point shared by the HTTP API and the inbound request
//! channel, so both paths go through one set of validations and state-machine
//! invariants.

use chrono::Utc;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::{
    BackoffStrategy, CancelOutcome, Job, JobCorrelation, JobId, Recipient, Trigger,
};
use crate::error::{ErrorCode, PulseError, Result};
use crate::events::{JobStatusEvent, StatusEventEmitter};
use crate::repository::JobRepository;

/// How many times a cancel or reschedule retries after losing an optimistic
/// race against the scheduler before giving up.
const UPDATE_RETRY_LIMIT: u32 = 3;

/// Request to create a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateJobRequest {
    pub trigger: Trigger,
    pub recipient: Recipient,
    #[serde(default)]
    pub correlation: JobCorrelation,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub backoff: BackoffStrategy,
    /// Per-attempt deadline in milliseconds; the global default applies when
    /// absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_timeout_ms: Option<u64>,
}

/// Job creation, cancellation, and lookup.
pub struct JobService {
    repository: Arc<dyn JobRepository>,
    emitter: Arc<dyn StatusEventEmitter>,
}

impl JobService {
    pub fn new(repository: Arc<dyn JobRepository>, emitter: Arc<dyn StatusEventEmitter>) -> Self {
        Self {
            repository,
            emitter,
        }
    }

    /// Validate and persist a new job.
    ///
    /// Configuration errors (malformed trigger or recipient) are rejected
    /// here synchronously; the job is never persisted.
    pub async fn create(&self, request: CreateJobRequest) -> Result<Job> {
        request.trigger.validate()?;
        request.recipient.validate()?;

        let job = Job::new(
            request.trigger,
            request.recipient,
            request.correlation,
            request.max_retries,
            request.backoff,
            request.execution_timeout_ms.map(Duration::from_millis),
            Utc::now(),
        )?;

        let job = self.repository.save(job).await?;
        counter!("pulse_jobs_created_total").increment(1);
        self.emitter.emit(JobStatusEvent::from_job(&job));

        tracing::info!(
            job_id = %job.id,
            recipient = %job.recipient.kind(),
            fire_time = %job.fire_time,
            "Job created"
        );
        Ok(job)
    }

    /// Look up a job by id.
    pub async fn get(&self, id: JobId) -> Result<Option<Job>> {
        self.repository.get(id).await
    }

    /// Cancel a job.
    ///
    /// Idempotent: canceling an already-terminal job returns the job
    /// unchanged. A job mid-execution gets a deferred cancellation, applied
    /// by the scheduler once the in-flight attempt resolves.
    pub async fn cancel(&self, id: JobId) -> Result<Job> {
        for _ in 0..UPDATE_RETRY_LIMIT {
            let mut job = self
                .repository
                .get(id)
                .await?
                .ok_or_else(|| PulseError::not_found("job", id.to_string()))?;
            let expected = job.version;

            match job.request_cancel(Utc::now()) {
                CancelOutcome::AlreadyTerminal => return Ok(job),
                CancelOutcome::Canceled | CancelOutcome::Deferred => {
                    match self.repository.update(job, expected).await {
                        Ok(job) => {
                            if job.status == super::JobStatus::Canceled {
                                counter!("pulse_jobs_canceled_total").increment(1);
                                self.emitter.emit(JobStatusEvent::from_job(&job));
                            }
                            tracing::info!(job_id = %job.id, status = %job.status, "Cancel applied");
                            return Ok(job);
                        }
                        // The scheduler moved the job concurrently; re-read
                        // and decide again from the fresh state.
                        Err(e) if e.code() == ErrorCode::VersionConflict => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        Err(PulseError::version_conflict(id.to_string()))
    }

    /// Replace the trigger of a non-terminal job.
    pub async fn reschedule(&self, id: JobId, trigger: Trigger) -> Result<Job> {
        trigger.validate()?;

        for _ in 0..UPDATE_RETRY_LIMIT {
            let mut job = self
                .repository
                .get(id)
                .await?
                .ok_or_else(|| PulseError::not_found("job", id.to_string()))?;
            let expected = job.version;

            job.reschedule(trigger.clone(), Utc::now())?;
            match self.repository.update(job, expected).await {
                Ok(job) => {
                    self.emitter.emit(JobStatusEvent::from_job(&job));
                    tracing::info!(job_id = %job.id, fire_time = %job.fire_time, "Job rescheduled");
                    return Ok(job);
                }
                Err(e) if e.code() == ErrorCode::VersionConflict => continue,
                Err(e) => return Err(e),
            }
        }

        Err(PulseError::version_conflict(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::jobs::JobStatus;
    use crate::repository::InMemoryRepository;
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;

    fn service() -> (JobService, Arc<InMemoryRepository>, Arc<EventBus>) {
        let repo = Arc::new(InMemoryRepository::new());
        let bus = Arc::new(EventBus::new(32));
        let service = JobService::new(repo.clone(), bus.clone());
        (service, repo, bus)
    }

    fn http_request() -> CreateJobRequest {
        CreateJobRequest {
            trigger: Trigger::PointInTime {
                fire_time: Utc::now() + chrono::Duration::hours(1),
            },
            recipient: Recipient::Http {
                url: "https://example.com/cb".to_string(),
                method: "POST".to_string(),
                headers: HashMap::new(),
                payload: None,
            },
            correlation: JobCorrelation::default(),
            max_retries: 2,
            backoff: BackoffStrategy::default(),
            execution_timeout_ms: Some(5_000),
        }
    }

    #[tokio::test]
    async fn test_create_persists_and_emits() {
        let (service, repo, bus) = service();
        let mut rx = bus.subscribe();

        let job = service.create(http_request()).await.unwrap();
        assert_eq!(job.status, JobStatus::Scheduled);
        assert_eq!(
            job.execution_timeout,
            Some(Duration::from_millis(5_000))
        );
        assert!(repo.get(job.id).await.unwrap().is_some());

        let event = rx.recv().await.unwrap();
        assert_eq!(event.job_id, job.id);
        assert_eq!(event.status, JobStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_create_rejects_malformed_trigger() {
        let (service, repo, _) = service();
        let mut request = http_request();
        request.trigger = Trigger::Cron {
            expression: "bogus".to_string(),
        };

        let err = service.create(request).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidCronExpression);
        // Never persisted.
        assert!(repo.is_empty().await);
    }

    #[tokio::test]
    async fn test_create_rejects_malformed_recipient() {
        let (service, repo, _) = service();
        let mut request = http_request();
        request.recipient = Recipient::Http {
            url: "nope".to_string(),
            method: "POST".to_string(),
            headers: HashMap::new(),
            payload: None,
        };

        let err = service.create(request).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidRecipient);
        assert!(repo.is_empty().await);
    }

    #[tokio::test]
    async fn test_cancel_scheduled_job() {
        let (service, _, bus) = service();
        let job = service.create(http_request()).await.unwrap();
        let mut rx = bus.subscribe();

        let canceled = service.cancel(job.id).await.unwrap();
        assert_eq!(canceled.status, JobStatus::Canceled);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.status, JobStatus::Canceled);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_on_terminal() {
        let (service, _, _) = service();
        let job = service.create(http_request()).await.unwrap();

        service.cancel(job.id).await.unwrap();
        // Second cancel is a no-op, not an error.
        let again = service.cancel(job.id).await.unwrap();
        assert_eq!(again.status, JobStatus::Canceled);
    }

    #[tokio::test]
    async fn test_cancel_unknown_job() {
        let (service, _, _) = service();
        let err = service.cancel(JobId::new()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::JobNotFound);
    }

    #[tokio::test]
    async fn test_reschedule() {
        let (service, _, _) = service();
        let job = service.create(http_request()).await.unwrap();

        let new_time = Utc.timestamp_opt(4_102_444_800, 0).unwrap();
        let updated = service
            .reschedule(job.id, Trigger::PointInTime { fire_time: new_time })
            .await
            .unwrap();
        assert_eq!(updated.fire_time, new_time);
        assert_eq!(updated.status, JobStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_reschedule_terminal_job_fails() {
        let (service, _, _) = service();
        let job = service.create(http_request()).await.unwrap();
        service.cancel(job.id).await.unwrap();

        let err = service
            .reschedule(
                job.id,
                Trigger::PointInTime {
                    fire_time: Utc::now() + chrono::Duration::hours(2),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::JobTerminal);
    }
}
