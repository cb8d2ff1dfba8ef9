//! Job HTTP endpoints.
//!
//! POST /api/v1/weather/fill-missing: start the fill-missing batch.
//! GET  /api/v1/jobs/status: job counters as JSON.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

use super::AppState;
use crate::errors::ErrorResponse;
use crate::services::jobs::{self, JobState};

/// Acknowledgement of a started batch.
#[derive(Debug, Serialize, ToSchema)]
pub struct BatchAccepted {
    /// Always "started"; progress is reported by the jobs status endpoint.
    pub status: String,
}

/// Start filling weather for every ride without it.
///
/// Per-ride jobs start staggered and retrain the model once at the end.
#[utoipa::path(
    post,
    path = "/api/v1/weather/fill-missing",
    tag = "Jobs",
    responses(
        (status = 202, description = "Batch started", body = BatchAccepted),
        (status = 500, description = "Internal error", body = ErrorResponse),
    )
)]
pub async fn fill_missing_weather(
    State(state): State<AppState>,
) -> (StatusCode, Json<BatchAccepted>) {
    tokio::spawn(async move {
        if let Err(e) = jobs::fill_missing_weather(
            &state.service,
            &state.retry,
            state.fan_out_spacing,
            &state.jobs,
        )
        .await
        {
            tracing::error!("Fill-missing batch failed: {}", e);
            state.jobs.write().await.last_error = Some(e.to_string());
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(BatchAccepted {
            status: "started".to_string(),
        }),
    )
}

/// Get the current job counters.
#[utoipa::path(
    get,
    path = "/api/v1/jobs/status",
    tag = "Jobs",
    responses(
        (status = 200, description = "Current job status", body = JobState),
    )
)]
pub async fn get_job_status(State(state): State<AppState>) -> Json<JobState> {
    let s = state.jobs.read().await;
    Json(s.clone())
}
