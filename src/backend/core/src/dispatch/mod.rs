//! Recipient dispatch: delivering a fired job to its target.
//!
//! Each recipient kind has a pluggable [`JobExecutor`]; the
//! [`ExecutorResolver`] selects one by the recipient's kind tag and bounds
//! the attempt with the job's execution timeout. Outcomes are classified
//! retryable vs fatal, which drives the retry budget in the state machine.

pub mod broker;
pub mod http;
pub mod sink;

pub use broker::BrokerExecutor;
pub use http::HttpExecutor;
pub use sink::SinkExecutor;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ErrorCode, PulseError, Result};
use crate::jobs::{Job, RecipientKind};

/// Result of one dispatch attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// The recipient accepted the notification.
    Success { message: Option<String> },
    /// Transient failure: consumes one unit of the retry budget.
    Retryable { cause: String },
    /// Permanent failure: the job goes straight to terminal ERROR.
    Fatal { cause: String },
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// A pluggable executor for one recipient kind.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// The recipient kind this executor serves.
    fn kind(&self) -> RecipientKind;

    /// Perform one delivery attempt. Deadlines are enforced by the resolver,
    /// not the executor.
    async fn execute(&self, job: &Job) -> ExecutionOutcome;
}

/// Maps a job's recipient kind to its executor.
pub struct ExecutorResolver {
    executors: HashMap<RecipientKind, Arc<dyn JobExecutor>>,
    default_timeout: Duration,
}

impl ExecutorResolver {
    /// Build a resolver over the given executors.
    pub fn new(executors: Vec<Arc<dyn JobExecutor>>, default_timeout: Duration) -> Self {
        let executors = executors.into_iter().map(|e| (e.kind(), e)).collect();
        Self {
            executors,
            default_timeout,
        }
    }

    /// Standard production wiring: HTTP, broker, and sink executors.
    pub fn standard(
        http: Arc<HttpExecutor>,
        broker: Arc<BrokerExecutor>,
        sink: Arc<SinkExecutor>,
        default_timeout: Duration,
    ) -> Self {
        Self::new(
            vec![http as Arc<dyn JobExecutor>, broker, sink],
            default_timeout,
        )
    }

    /// Look up the executor for a recipient kind.
    ///
    /// Creation-time validation makes a miss unreachable for persisted jobs,
    /// but the resolver still fails closed.
    pub fn resolve(&self, kind: RecipientKind) -> Result<Arc<dyn JobExecutor>> {
        self.executors.get(&kind).cloned().ok_or_else(|| {
            PulseError::new(
                ErrorCode::UnknownRecipientKind,
                format!("No executor registered for recipient kind: {}", kind),
            )
        })
    }

    /// Execute one attempt, bounded by the job's execution timeout (or the
    /// global default). An elapsed deadline is a retryable failure.
    pub async fn dispatch(&self, job: &Job) -> ExecutionOutcome {
        let executor = match self.resolve(job.recipient.kind()) {
            Ok(executor) => executor,
            Err(e) => {
                return ExecutionOutcome::Fatal {
                    cause: e.to_string(),
                }
            }
        };

        let deadline = job.execution_timeout.unwrap_or(self.default_timeout);
        match tokio::time::timeout(deadline, executor.execute(job)).await {
            Ok(outcome) => outcome,
            Err(_) => ExecutionOutcome::Retryable {
                cause: format!("Dispatch exceeded the {:?} deadline", deadline),
            },
        }
    }
}
