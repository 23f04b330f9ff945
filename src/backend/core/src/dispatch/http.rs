//! HTTP callback executor.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use super::{ExecutionOutcome, JobExecutor};
use crate::jobs::{Job, Recipient, RecipientKind};

/// Delivers fired jobs as HTTP requests to caller-provided endpoints.
///
/// Classification: a 2xx response is success; connection failures, timeouts,
/// 408/429 and 5xx are retryable; any other 4xx is a permanent client error.
pub struct HttpExecutor {
    client: reqwest::Client,
}

impl HttpExecutor {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpExecutor {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

#[async_trait]
impl JobExecutor for HttpExecutor {
    fn kind(&self) -> RecipientKind {
        RecipientKind::Http
    }

    async fn execute(&self, job: &Job) -> ExecutionOutcome {
        let (url, method, headers, payload) = match &job.recipient {
            Recipient::Http {
                url,
                method,
                headers,
                payload,
            } => (url, method, headers, payload),
            other => {
                return ExecutionOutcome::Fatal {
                    cause: format!("HTTP executor received a {} recipient", other.kind()),
                }
            }
        };

        let method = match reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes()) {
            Ok(m) => m,
            Err(e) => {
                return ExecutionOutcome::Fatal {
                    cause: format!("Invalid HTTP method {}: {}", method, e),
                }
            }
        };

        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            let name = match HeaderName::from_bytes(name.as_bytes()) {
                Ok(n) => n,
                Err(e) => {
                    return ExecutionOutcome::Fatal {
                        cause: format!("Invalid header name {}: {}", name, e),
                    }
                }
            };
            let value = match HeaderValue::from_str(value) {
                Ok(v) => v,
                Err(e) => {
                    return ExecutionOutcome::Fatal {
                        cause: format!("Invalid header value for {}: {}", name, e),
                    }
                }
            };
            header_map.insert(name, value);
        }

        let mut request = self.client.request(method, url.as_str()).headers(header_map);
        if let Some(payload) = payload {
            request = request.json(payload);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                // Connection-level failures are transient by classification;
                // request-construction failures are not.
                if e.is_builder() || e.is_request() {
                    return ExecutionOutcome::Fatal {
                        cause: format!("Failed to build request: {}", e),
                    };
                }
                return ExecutionOutcome::Retryable {
                    cause: format!("Failed to reach {}: {}", url, e),
                };
            }
        };

        let status = response.status();
        if status.is_success() {
            ExecutionOutcome::Success {
                message: Some(format!("{} {}", status.as_u16(), url)),
            }
        } else if status.is_server_error()
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        {
            ExecutionOutcome::Retryable {
                cause: format!("Recipient returned {}", status),
            }
        } else {
            ExecutionOutcome::Fatal {
                cause: format!("Recipient rejected the request with {}", status),
            }
        }
    }
}
