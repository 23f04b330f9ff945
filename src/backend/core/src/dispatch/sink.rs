//! Serverless sink executor.
//!
//! The sink URL is resolved from the runtime environment (`K_SINK`, the
//! knative convention) at dispatch time, with an optional configuration
//! override. Absence or a malformed URL is fatal for the attempt and is also
//! surfaced proactively through the readiness probe.

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{ExecutionOutcome, JobExecutor};
use crate::jobs::{Job, Recipient, RecipientKind, SinkContentMode};

const SINK_ENV_VAR: &str = "K_SINK";
const EVENT_TYPE: &str = "pulse.job.fired";
const EVENT_SOURCE: &str = "/pulse/jobs";

/// Delivers fired jobs as events to the environment-resolved sink.
pub struct SinkExecutor {
    client: reqwest::Client,
    configured_url: Option<String>,
}

impl SinkExecutor {
    pub fn new(client: reqwest::Client, configured_url: Option<String>) -> Self {
        Self {
            client,
            configured_url,
        }
    }

    /// Resolve the sink URL: configuration override first, then the runtime
    /// environment. Resolution happens per dispatch, not at startup.
    pub fn resolve_url(&self) -> Option<String> {
        self.configured_url
            .clone()
            .or_else(|| std::env::var(SINK_ENV_VAR).ok())
            .filter(|url| !url.trim().is_empty())
    }

    /// Whether a sink is configured; exposed by the readiness probe so the
    /// operator is warned before sink jobs start failing.
    pub fn is_configured(&self) -> bool {
        self.resolve_url()
            .map(|url| reqwest::Url::parse(&url).is_ok())
            .unwrap_or(false)
    }
}

#[async_trait]
impl JobExecutor for SinkExecutor {
    fn kind(&self) -> RecipientKind {
        RecipientKind::Sink
    }

    async fn execute(&self, job: &Job) -> ExecutionOutcome {
        let content_mode = match &job.recipient {
            Recipient::Sink { content_mode } => *content_mode,
            other => {
                return ExecutionOutcome::Fatal {
                    cause: format!("Sink executor received a {} recipient", other.kind()),
                }
            }
        };

        let url = match self.resolve_url() {
            Some(url) => url,
            None => {
                return ExecutionOutcome::Fatal {
                    cause: format!("No sink configured ({} is not set)", SINK_ENV_VAR),
                }
            }
        };
        let url = match reqwest::Url::parse(&url) {
            Ok(url) => url,
            Err(e) => {
                return ExecutionOutcome::Fatal {
                    cause: format!("Malformed sink URL {}: {}", url, e),
                }
            }
        };

        let event_id = Uuid::new_v4().to_string();
        let data = serde_json::json!({
            "job_id": job.id,
            "fire_time": job.fire_time,
            "executions": job.executions,
            "correlation": job.correlation,
        });

        let request = match content_mode {
            SinkContentMode::Binary => self
                .client
                .post(url.clone())
                .header("ce-specversion", "1.0")
                .header("ce-id", &event_id)
                .header("ce-type", EVENT_TYPE)
                .header("ce-source", EVENT_SOURCE)
                .header("ce-time", Utc::now().to_rfc3339())
                .json(&data),
            SinkContentMode::Structured => self
                .client
                .post(url.clone())
                .header("content-type", "application/cloudevents+json")
                .json(&serde_json::json!({
                    "specversion": "1.0",
                    "id": event_id,
                    "type": EVENT_TYPE,
                    "source": EVENT_SOURCE,
                    "time": Utc::now().to_rfc3339(),
                    "data": data,
                })),
        };

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                return ExecutionOutcome::Retryable {
                    cause: format!("Failed to reach sink {}: {}", url, e),
                }
            }
        };

        let status = response.status();
        if status.is_success() {
            ExecutionOutcome::Success {
                message: Some(format!("{} {}", status.as_u16(), url)),
            }
        } else if status.is_server_error() {
            ExecutionOutcome::Retryable {
                cause: format!("Sink returned {}", status),
            }
        } else {
            ExecutionOutcome::Fatal {
                cause: format!("Sink rejected the event with {}", status),
            }
        }
    }
}
