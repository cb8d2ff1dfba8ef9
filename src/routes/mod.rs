pub mod health;
pub mod jobs;
pub mod requests;
pub mod rides;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use crate::db::store::FetchLedger;
use crate::services::jobs::{RetryPolicy, SharedJobState};
use crate::services::ride_weather::RideWeatherService;

/// Shared application state for all endpoints.
#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) pool: sqlx::PgPool,
    pub(crate) ledger: Arc<dyn FetchLedger>,
    pub(crate) service: RideWeatherService,
    pub(crate) jobs: SharedJobState,
    pub(crate) retry: RetryPolicy,
    pub(crate) fan_out_spacing: StdDuration,
    /// Upstream cooldown after a rate-limited response.
    pub(crate) cooldown: chrono::Duration,
}
