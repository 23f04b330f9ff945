//! Inbound job-request channel.
//!
//! Business events that originate job requests (from the workflow and
//! decision engines) arrive as messages on an explicit channel and feed the
//! same [`JobService`] as the HTTP path, so both share one set of
//! validations and state-machine invariants.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::jobs::{CreateJobRequest, JobId, JobService};

/// A job request arriving over the inbound channel.
#[derive(Debug)]
pub enum JobRequestMessage {
    Create(CreateJobRequest),
    Cancel(JobId),
}

/// Consumes inbound job requests and applies them through the service.
pub struct RequestIngestor {
    service: Arc<JobService>,
    receiver: mpsc::Receiver<JobRequestMessage>,
}

impl RequestIngestor {
    /// Create an ingestor and the sender half handed to message consumers.
    pub fn channel(
        service: Arc<JobService>,
        capacity: usize,
    ) -> (mpsc::Sender<JobRequestMessage>, Self) {
        let (sender, receiver) = mpsc::channel(capacity);
        (sender, Self { service, receiver })
    }

    /// Drain the channel until `shutdown` fires or all senders are dropped.
    ///
    /// Failures are logged and never tear the loop down: an invalid inbound
    /// request only affects that request, observable through job status
    /// events like every other asynchronous failure.
    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!("Request ingestor started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                message = self.receiver.recv() => {
                    match message {
                        Some(message) => self.handle(message).await,
                        None => break,
                    }
                }
            }
        }
        tracing::info!("Request ingestor stopped");
    }

    async fn handle(&self, message: JobRequestMessage) {
        match message {
            JobRequestMessage::Create(request) => {
                if let Err(e) = self.service.create(request).await {
                    tracing::warn!(error = %e, "Inbound job creation rejected");
                }
            }
            JobRequestMessage::Cancel(job_id) => {
                if let Err(e) = self.service.cancel(job_id).await {
                    tracing::warn!(job_id = %job_id, error = %e, "Inbound job cancellation failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::jobs::{BackoffStrategy, JobCorrelation, JobStatus, Recipient, Trigger};
    use crate::repository::{InMemoryRepository, JobRepository};
    use chrono::Utc;
    use std::collections::HashMap;

    fn request() -> CreateJobRequest {
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
            max_retries: 0,
            backoff: BackoffStrategy::default(),
            execution_timeout_ms: None,
        }
    }

    #[tokio::test]
    async fn test_inbound_create_and_cancel() {
        let repo = Arc::new(InMemoryRepository::new());
        let bus = Arc::new(EventBus::new(32));
        let service = Arc::new(JobService::new(repo.clone(), bus.clone()));
        let mut events = bus.subscribe();

        let (sender, ingestor) = RequestIngestor::channel(service, 16);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(ingestor.run(shutdown.clone()));

        sender
            .send(JobRequestMessage::Create(request()))
            .await
            .unwrap();

        let created = events.recv().await.unwrap();
        assert_eq!(created.status, JobStatus::Scheduled);

        sender
            .send(JobRequestMessage::Cancel(created.job_id))
            .await
            .unwrap();
        let canceled = events.recv().await.unwrap();
        assert_eq!(canceled.status, JobStatus::Canceled);

        let stored = repo.get(created.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Canceled);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_inbound_request_does_not_stop_the_loop() {
        let repo = Arc::new(InMemoryRepository::new());
        let bus = Arc::new(EventBus::new(32));
        let service = Arc::new(JobService::new(repo.clone(), bus.clone()));
        let mut events = bus.subscribe();

        let (sender, ingestor) = RequestIngestor::channel(service, 16);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(ingestor.run(shutdown.clone()));

        let mut bad = request();
        bad.trigger = Trigger::Cron {
            expression: "nope".to_string(),
        };
        sender.send(JobRequestMessage::Create(bad)).await.unwrap();
        sender
            .send(JobRequestMessage::Create(request()))
            .await
            .unwrap();

        // Only the valid request produced a job.
        let created = events.recv().await.unwrap();
        assert_eq!(created.status, JobStatus::Scheduled);

        shutdown.cancel();
        task.await.unwrap();
    }
}
