//! API request handlers with proper error propagation.

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ApiResponse, AppState};
use crate::error::PulseError;
use crate::jobs::{CreateJobRequest, Job, JobCorrelation, JobId, Trigger};

// ═══════════════════════════════════════════════════════════════════════════════
// Job DTOs
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub id: Uuid,
    pub status: String,
    pub fire_time: DateTime<Utc>,
    pub retries: u32,
    pub max_retries: u32,
    pub executions: u32,
    pub correlation: JobCorrelation,
    pub created_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

impl From<&Job> for JobResponse {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.0,
            status: job.status.as_str().to_string(),
            fire_time: job.fire_time,
            retries: job.retries,
            max_retries: job.max_retries,
            executions: job.executions,
            correlation: job.correlation.clone(),
            created_at: job.created_at,
            last_update: job.last_update,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RescheduleRequest {
    pub trigger: Trigger,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Handlers
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn create_job(
    State(state): State<AppState>,
    Json(request): Json<CreateJobRequest>,
) -> Result<impl IntoResponse, PulseError> {
    let job = state.service.create(request).await?;

    Ok((
        axum::http::StatusCode::CREATED,
        Json(ApiResponse::success(JobResponse::from(&job))),
    ))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, PulseError> {
    let job = state
        .service
        .get(JobId(id))
        .await?
        .ok_or_else(|| PulseError::not_found("job", id.to_string()))?;

    Ok(Json(ApiResponse::success(JobResponse::from(&job))))
}

pub async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, PulseError> {
    let job = state
        .service
        .get(JobId(id))
        .await?
        .ok_or_else(|| PulseError::not_found("job", id.to_string()))?;

    Ok(Json(ApiResponse::success(serde_json::json!({
        "id": job.id,
        "status": job.status,
        "retries": job.retries,
        "executions": job.executions,
        "fire_time": job.fire_time,
    }))))
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, PulseError> {
    let job = state.service.cancel(JobId(id)).await?;

    Ok(Json(ApiResponse::success(JobResponse::from(&job))))
}

pub async fn reschedule_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<RescheduleRequest>,
) -> Result<impl IntoResponse, PulseError> {
    let job = state.service.reschedule(JobId(id), request.trigger).await?;

    Ok(Json(ApiResponse::success(JobResponse::from(&job))))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Health Handlers
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn health_live(State(state): State<AppState>) -> impl IntoResponse {
    state.health.live().await
}

pub async fn health_ready(State(state): State<AppState>) -> impl IntoResponse {
    state.health.ready().await
}

pub async fn health_master(State(state): State<AppState>) -> impl IntoResponse {
    state.health.master().await
}
