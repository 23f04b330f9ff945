//! Job status events for external consumers.
//!
//! Every state-machine transition is published as a [`JobStatusEvent`]. The
//! data-index and audit collaborators consume these; this service only
//! guarantees emission, not delivery beyond its own boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::jobs::{Job, JobCorrelation, JobId, JobStatus};

/// Event emitted on every job state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusEvent {
    /// Job identifier
    pub job_id: JobId,
    /// Status after the transition
    pub status: JobStatus,
    /// Next (or last) fire time at the moment of the transition
    pub fire_time: DateTime<Utc>,
    /// Attempts consumed for the current occurrence
    pub retries: u32,
    /// Successful executions so far
    pub executions: u32,
    /// Process/instance correlation
    #[serde(default)]
    pub correlation: JobCorrelation,
    /// When the transition happened
    pub timestamp: DateTime<Utc>,
}

impl JobStatusEvent {
    /// Build an event from the job's post-transition state.
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            fire_time: job.fire_time,
            retries: job.retries,
            executions: job.executions,
            correlation: job.correlation.clone(),
            timestamp: job.last_update,
        }
    }
}

/// Sink for job status events.
pub trait StatusEventEmitter: Send + Sync {
    /// Publish one transition. Must not block and must not fail the
    /// transition that produced the event.
    fn emit(&self, event: JobStatusEvent);
}

/// Broadcast-channel event bus.
///
/// In-process consumers (API streaming, tests, audit forwarders) subscribe to
/// the channel; every event is also logged with structured fields. Lagging or
/// absent subscribers never fail emission.
pub struct EventBus {
    sender: broadcast::Sender<JobStatusEvent>,
}

impl EventBus {
    /// Create a bus with the given subscriber buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<JobStatusEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl StatusEventEmitter for EventBus {
    fn emit(&self, event: JobStatusEvent) {
        tracing::info!(
            job_id = %event.job_id,
            status = %event.status,
            retries = event.retries,
            executions = event.executions,
            fire_time = %event.fire_time,
            "Job status changed"
        );
        // No subscribers is fine; the send result only signals that.
        let _ = self.sender.send(event);
    }
}
