//! The job domain: records, triggers, recipients, and the creation service.
//!
//! A job combines a [`Trigger`] (when to fire), a [`Recipient`] (where to
//! deliver), and a status state machine with a retry budget. The scheduler
//! loop drives jobs through the state machine; this module owns the
//! transition rules themselves.

pub mod job;
pub mod recipient;
pub mod service;
pub mod trigger;

pub use job::{
    BackoffStrategy, CancelOutcome, Job, JobCorrelation, JobId, JobStatus,
};
pub use recipient::{Recipient, RecipientKind, SinkContentMode};
pub use service::{CreateJobRequest, JobService};
pub use trigger::Trigger;
