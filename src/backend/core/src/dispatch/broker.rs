//! Message-broker executor (Redis publish).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{ExecutionOutcome, JobExecutor};
use crate::jobs::{Job, JobId, Recipient, RecipientKind};

/// Message published to the broker channel when a job fires.
#[derive(Debug, Serialize)]
struct BrokerMessage<'a> {
    job_id: JobId,
    fired_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: &'a Option<serde_json::Value>,
}

/// Publishes fired jobs to a Redis channel.
///
/// Classification: transport-level send failure is retryable; payload
/// serialization failure is fatal.
pub struct BrokerExecutor {
    client: redis::Client,
}

impl BrokerExecutor {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    /// Connect to the broker at `url`.
    pub fn connect(url: &str) -> crate::error::Result<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self::new(client))
    }
}

#[async_trait]
impl JobExecutor for BrokerExecutor {
    fn kind(&self) -> RecipientKind {
        RecipientKind::Broker
    }

    async fn execute(&self, job: &Job) -> ExecutionOutcome {
        let (channel, payload) = match &job.recipient {
            Recipient::Broker { channel, payload } => (channel, payload),
            other => {
                return ExecutionOutcome::Fatal {
                    cause: format!("Broker executor received a {} recipient", other.kind()),
                }
            }
        };

        let message = BrokerMessage {
            job_id: job.id,
            fired_at: Utc::now(),
            payload,
        };
        let serialized = match serde_json::to_string(&message) {
            Ok(s) => s,
            Err(e) => {
                return ExecutionOutcome::Fatal {
                    cause: format!("Failed to serialize broker message: {}", e),
                }
            }
        };

        let mut conn = match self.client.get_multiplexed_async_connection().await {
            Ok(conn) => conn,
            Err(e) => {
                return ExecutionOutcome::Retryable {
                    cause: format!("Failed to connect to broker: {}", e),
                }
            }
        };

        match redis::cmd("PUBLISH")
            .arg(channel)
            .arg(&serialized)
            .query_async::<_, i64>(&mut conn)
            .await
        {
            Ok(receivers) => {
                tracing::debug!(
                    job_id = %job.id,
                    channel = %channel,
                    receivers,
                    "Published job event"
                );
                ExecutionOutcome::Success {
                    message: Some(format!("published to {}", channel)),
                }
            }
            Err(e) => ExecutionOutcome::Retryable {
                cause: format!("Failed to publish to {}: {}", channel, e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{BackoffStrategy, JobCorrelation, Trigger};
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_unreachable_broker_is_retryable() {
        let executor = BrokerExecutor::connect("redis://127.0.0.1:1/").unwrap();
        let job = Job::new(
            Trigger::PointInTime {
                fire_time: Utc.timestamp_opt(1_000, 0).unwrap(),
            },
            Recipient::Broker {
                channel: "job-events".to_string(),
                payload: Some(serde_json::json!({"k": "v"})),
            },
            JobCorrelation::default(),
            0,
            BackoffStrategy::default(),
            None,
            Utc.timestamp_opt(500, 0).unwrap(),
        )
        .unwrap();

        let outcome = executor.execute(&job).await;
        assert!(matches!(outcome, ExecutionOutcome::Retryable { .. }));
    }
}
