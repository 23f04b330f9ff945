//! # Pulse Core
//!
//! A horizontally-replicated job scheduling and notification service.
//!
//! ## Architecture
//!
//! - **Jobs**: job records, trigger calculation, and the status state machine
//! - **Repository**: persistence contract with in-memory and PostgreSQL backends
//! - **Leader**: heartbeat-lease master election across replicas
//! - **Scheduler**: the master-only polling loop that fires due jobs
//! - **Dispatch**: pluggable recipient executors (HTTP, broker, sink)
//! - **Events**: status events emitted on every job transition
//! - **Ingest**: inbound request channel sharing the HTTP path's invariants

pub mod api;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod health;
pub mod ingest;
pub mod jobs;
pub mod leader;
pub mod observability;
pub mod repository;
pub mod scheduler;

pub use error::{ErrorCode, ErrorContext, PulseError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::dispatch::{
        BrokerExecutor, ExecutionOutcome, ExecutorResolver, HttpExecutor, JobExecutor,
        SinkExecutor,
    };
    pub use crate::error::{ErrorCode, ErrorContext, PulseError, Result};
    pub use crate::events::{EventBus, JobStatusEvent, StatusEventEmitter};
    pub use crate::jobs::{
        BackoffStrategy, CancelOutcome, CreateJobRequest, Job, JobCorrelation, JobId,
        JobService, JobStatus, Recipient, RecipientKind, SinkContentMode, Trigger,
    };
    pub use crate::leader::{LeaderCoordinator, LeaseRecord};
    pub use crate::repository::{
        InMemoryRepository, JobRepository, LeaseRepository, PostgresRepository,
    };
    pub use crate::scheduler::SchedulerLoop;
}
