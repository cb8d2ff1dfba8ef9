//! Upstream request ledger endpoint.
//!
//! GET /api/v1/ogimet/requests?window_minutes=N

use axum::extract::{Query, State};
use axum::Json;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use super::AppState;
use crate::db::models::{FetchRecord, RequestStats};
use crate::db::queries;
use crate::errors::{AppError, ErrorResponse};

/// Default look-back window, matching the upstream quota window.
const DEFAULT_WINDOW_MINUTES: i64 = 120;
/// Largest accepted look-back window (one week).
const MAX_WINDOW_MINUTES: i64 = 7 * 24 * 60;
/// Number of individual requests listed in the response.
const RECENT_REQUESTS_LIMIT: i64 = 20;

#[derive(Debug, Deserialize, IntoParams)]
pub struct RequestStatsQuery {
    /// Look-back window in minutes (default 120, max 10080)
    pub window_minutes: Option<i64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RequestStatsResponse {
    pub window_minutes: i64,
    pub stats: RequestStats,
    /// Most recent requests, newest first, regardless of the window.
    pub recent: Vec<FetchRecord>,
}

fn window_minutes(query: &RequestStatsQuery) -> Result<i64, AppError> {
    let minutes = query.window_minutes.unwrap_or(DEFAULT_WINDOW_MINUTES);
    if !(1..=MAX_WINDOW_MINUTES).contains(&minutes) {
        return Err(AppError::BadRequest(format!(
            "window_minutes must be between 1 and {}",
            MAX_WINDOW_MINUTES
        )));
    }
    Ok(minutes)
}

/// Get upstream request statistics.
///
/// Counts requests and rate-limited responses over the trailing window, and
/// lists the latest individual requests.
#[utoipa::path(
    get,
    path = "/api/v1/ogimet/requests",
    tag = "Upstream",
    params(RequestStatsQuery),
    responses(
        (status = 200, description = "Request statistics", body = RequestStatsResponse),
        (status = 400, description = "Invalid window", body = ErrorResponse),
    )
)]
pub async fn get_request_stats(
    State(state): State<AppState>,
    Query(query): Query<RequestStatsQuery>,
) -> Result<Json<RequestStatsResponse>, AppError> {
    let minutes = window_minutes(&query)?;
    let since = Utc::now() - Duration::minutes(minutes);

    let stats = queries::request_stats(&state.pool, since).await?;
    let recent = queries::recent_requests(&state.pool, RECENT_REQUESTS_LIMIT).await?;

    Ok(Json(RequestStatsResponse {
        window_minutes: minutes,
        stats,
        recent,
    }))
}
