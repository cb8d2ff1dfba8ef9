//! Ride weather HTTP endpoints.
//!
//! - POST /api/v1/rides/:id/weather: queue a weather update for one ride
//! - GET  /api/v1/rides/:id/weather: stored averaged weather

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use super::AppState;
use crate::db::models::AveragedWeather;
use crate::errors::{AppError, ErrorResponse};
use crate::services::jobs;

/// Acknowledgement of a queued job.
#[derive(Debug, Serialize, ToSchema)]
pub struct JobAccepted {
    pub ride_id: Uuid,
    /// Always "queued"; follow progress on the jobs status endpoint.
    pub status: String,
}

/// Queue a weather update for one ride.
///
/// The update runs in the background with retries; an upstream rate limit
/// only delays it. Rides with incomplete time or location data are skipped
/// silently.
#[utoipa::path(
    post,
    path = "/api/v1/rides/{id}/weather",
    tag = "Rides",
    params(("id" = Uuid, Path, description = "Ride ID")),
    responses(
        (status = 202, description = "Update queued", body = JobAccepted),
        (status = 404, description = "Ride not found", body = ErrorResponse),
    )
)]
pub async fn queue_ride_weather(
    State(state): State<AppState>,
    Path(ride_id): Path<Uuid>,
) -> Result<(StatusCode, Json<JobAccepted>), AppError> {
    if !state.service.ride_exists(ride_id).await? {
        return Err(AppError::NotFound(format!("Ride {} not found", ride_id)));
    }

    jobs::enqueue(&state.jobs, 1).await;
    let AppState {
        service,
        jobs: job_state,
        retry,
        ..
    } = state;
    tokio::spawn(async move {
        if let Err(e) = jobs::run_update_job(&service, ride_id, &retry, &job_state).await {
            tracing::debug!("Background update of ride {} ended with: {}", ride_id, e);
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(JobAccepted {
            ride_id,
            status: "queued".to_string(),
        }),
    ))
}

/// Get the stored weather of a ride.
#[utoipa::path(
    get,
    path = "/api/v1/rides/{id}/weather",
    tag = "Rides",
    params(("id" = Uuid, Path, description = "Ride ID")),
    responses(
        (status = 200, description = "Averaged ride weather", body = AveragedWeather),
        (status = 404, description = "No weather stored for this ride", body = ErrorResponse),
    )
)]
pub async fn get_ride_weather(
    State(state): State<AppState>,
    Path(ride_id): Path<Uuid>,
) -> Result<Json<AveragedWeather>, AppError> {
    state
        .service
        .ride_weather(ride_id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("No weather for ride {}", ride_id)))
}
