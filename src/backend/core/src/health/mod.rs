//! Health and readiness signals.
//!
//! Three probes, Kubernetes-style:
//! - **live**: the process is running
//! - **ready**: storage reachable, and a sink is configured when serverless
//!   delivery is in use
//! - **master**: UP only while this replica holds the master lease — for
//!   informational routing and monitoring, never for correctness

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

use crate::dispatch::SinkExecutor;
use crate::jobs::JobStatus;
use crate::repository::JobRepository;

/// Health state of one component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Up,
    Down,
}

/// Health report for one component.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl ComponentHealth {
    pub fn up(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Up,
            message: None,
            checked_at: Utc::now(),
        }
    }

    pub fn down(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Down,
            message: None,
            checked_at: Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn is_up(&self) -> bool {
        self.status == HealthStatus::Up
    }
}

/// A single health check.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    fn name(&self) -> &str;
    async fn check(&self) -> ComponentHealth;
}

// ─────────────────────────────────────────────────────────────────────────────
// Checkers
// ─────────────────────────────────────────────────────────────────────────────

/// Storage connectivity probe.
pub struct StorageHealthChecker {
    repository: Arc<dyn JobRepository>,
}

impl StorageHealthChecker {
    pub fn new(repository: Arc<dyn JobRepository>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl HealthChecker for StorageHealthChecker {
    fn name(&self) -> &str {
        "storage"
    }

    async fn check(&self) -> ComponentHealth {
        match self.repository.ping().await {
            Ok(()) => {
                let mut health = ComponentHealth::up(self.name());
                if let Ok(counts) = self.repository.count_by_status().await {
                    let pending = counts.get(&JobStatus::Scheduled).copied().unwrap_or(0)
                        + counts.get(&JobStatus::Retry).copied().unwrap_or(0);
                    health = health.with_message(format!("{} jobs pending", pending));
                }
                health
            }
            Err(e) => ComponentHealth::down(self.name()).with_message(e.to_string()),
        }
    }
}

/// UP only while this replica holds the master lease.
pub struct MasterHealthChecker {
    mastership: watch::Receiver<bool>,
}

impl MasterHealthChecker {
    pub fn new(mastership: watch::Receiver<bool>) -> Self {
        Self { mastership }
    }
}

#[async_trait]
impl HealthChecker for MasterHealthChecker {
    fn name(&self) -> &str {
        "master"
    }

    async fn check(&self) -> ComponentHealth {
        if *self.mastership.borrow() {
            ComponentHealth::up(self.name())
        } else {
            ComponentHealth::down(self.name()).with_message("Not the current master")
        }
    }
}

/// Warns the operator before sink jobs start failing for lack of a sink URL.
pub struct SinkHealthChecker {
    sink: Arc<SinkExecutor>,
}

impl SinkHealthChecker {
    pub fn new(sink: Arc<SinkExecutor>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl HealthChecker for SinkHealthChecker {
    fn name(&self) -> &str {
        "sink"
    }

    async fn check(&self) -> ComponentHealth {
        if self.sink.is_configured() {
            ComponentHealth::up(self.name())
        } else {
            ComponentHealth::down(self.name()).with_message("No sink URL configured")
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service + routes
// ─────────────────────────────────────────────────────────────────────────────

/// Aggregated health report.
#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: Vec<ComponentHealth>,
}

impl HealthReport {
    fn of(components: Vec<ComponentHealth>) -> Self {
        let status = if components.iter().all(ComponentHealth::is_up) {
            HealthStatus::Up
        } else {
            HealthStatus::Down
        };
        Self { status, components }
    }
}

impl IntoResponse for HealthReport {
    fn into_response(self) -> Response {
        let code = match self.status {
            HealthStatus::Up => StatusCode::OK,
            HealthStatus::Down => StatusCode::SERVICE_UNAVAILABLE,
        };
        (code, Json(self)).into_response()
    }
}

/// Health probes shared by the API routes.
#[derive(Clone)]
pub struct HealthService {
    storage: Arc<StorageHealthChecker>,
    master: Arc<MasterHealthChecker>,
    sink: Arc<SinkHealthChecker>,
    /// Serverless deployments gate readiness on the sink indicator; others
    /// surface it informationally only.
    sink_required: bool,
}

impl HealthService {
    pub fn new(
        repository: Arc<dyn JobRepository>,
        mastership: watch::Receiver<bool>,
        sink: Arc<SinkExecutor>,
        sink_required: bool,
    ) -> Self {
        Self {
            storage: Arc::new(StorageHealthChecker::new(repository)),
            master: Arc::new(MasterHealthChecker::new(mastership)),
            sink: Arc::new(SinkHealthChecker::new(sink)),
            sink_required,
        }
    }

    /// Liveness: the process responds.
    pub async fn live(&self) -> HealthReport {
        HealthReport::of(vec![ComponentHealth::up("service")])
    }

    /// Readiness: storage reachable, and the sink configured where required.
    pub async fn ready(&self) -> HealthReport {
        let (storage, sink) = futures::join!(self.storage.check(), self.sink.check());

        let status = if storage.is_up() && (sink.is_up() || !self.sink_required) {
            HealthStatus::Up
        } else {
            HealthStatus::Down
        };
        HealthReport {
            status,
            components: vec![storage, sink],
        }
    }

    /// Mastership probe.
    pub async fn master(&self) -> HealthReport {
        HealthReport::of(vec![self.master.check().await])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryRepository;

    fn service(mastership: bool, sink_url: Option<&str>) -> HealthService {
        // A dropped sender keeps serving the last value to the receiver.
        let (_tx, rx) = watch::channel(mastership);
        HealthService::new(
            Arc::new(InMemoryRepository::new()),
            rx,
            Arc::new(SinkExecutor::new(
                reqwest::Client::new(),
                sink_url.map(String::from),
            )),
            sink_url.is_some(),
        )
    }

    #[tokio::test]
    async fn test_live_is_always_up() {
        let report = service(false, None).live().await;
        assert_eq!(report.status, HealthStatus::Up);
    }

    #[tokio::test]
    async fn test_master_probe_tracks_lease() {
        let up = service(true, None).master().await;
        assert_eq!(up.status, HealthStatus::Up);

        let down = service(false, None).master().await;
        assert_eq!(down.status, HealthStatus::Down);
    }

    #[tokio::test]
    async fn test_ready_gates_on_sink_only_when_required() {
        let ready = service(false, Some("http://sink.local")).ready().await;
        assert_eq!(ready.status, HealthStatus::Up);

        // Serverless deployment with a malformed sink: not ready.
        let not_ready = service(false, Some("::bad::")).ready().await;
        assert_eq!(not_ready.status, HealthStatus::Down);

        // No sink in use: the indicator is informational only.
        let no_sink = service(false, None).ready().await;
        assert_eq!(no_sink.status, HealthStatus::Up);
        assert!(no_sink.components.iter().any(|c| c.name == "sink" && !c.is_up()));
    }
}
