//! HTTP API surface.
//!
//! Job creation/cancellation plus the health probes. Handlers return
//! `Result<impl IntoResponse, PulseError>`; errors map to HTTP statuses
//! through the `IntoResponse` implementation on [`crate::error::PulseError`].

pub mod handlers;

use axum::routing::{delete, get, patch, post};
use axum::Router;
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::health::HealthService;
use crate::jobs::JobService;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<JobService>,
    pub health: HealthService,
}

/// Standard success envelope.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

/// Build the service router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v2/jobs", post(handlers::create_job))
        .route("/v2/jobs/:id", get(handlers::get_job))
        .route("/v2/jobs/:id", delete(handlers::cancel_job))
        .route("/v2/jobs/:id", patch(handlers::reschedule_job))
        .route("/v2/jobs/:id/status", get(handlers::get_job_status))
        .route("/health/live", get(handlers::health_live))
        .route("/health/ready", get(handlers::health_ready))
        .route("/health/master", get(handlers::health_master))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
