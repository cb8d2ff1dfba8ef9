//! Persistence seams of the weather pipeline.
//!
//! Postgres implements all of them (`db::queries::PgStore`); tests use the
//! in-memory implementations in `db::memory`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::models::{
    AveragedWeather, FetchWindow, NewObservation, RideRecord, Station, WeatherObservation,
};
use crate::errors::StoreError;

/// Durable store of decoded weather reports.
#[async_trait]
pub trait ObservationStore: Send + Sync {
    /// Return the stored report with the same station, time and raw text,
    /// inserting `observation` first if there is none.
    async fn get_or_insert(
        &self,
        observation: NewObservation,
    ) -> Result<WeatherObservation, StoreError>;

    /// Reports of one station with `start <= report_time <= end`, ascending.
    async fn query_range(
        &self,
        station_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<WeatherObservation>, StoreError>;
}

/// Ledger of outbound upstream requests and of fetched windows.
#[async_trait]
pub trait FetchLedger: Send + Sync {
    /// Record a request about to be sent. Returns the record id.
    async fn begin_request(&self, url: &str, requested_at: DateTime<Utc>)
        -> Result<Uuid, StoreError>;

    /// Record the outcome of a request.
    async fn finish_request(
        &self,
        id: Uuid,
        status_code: Option<i32>,
        rate_limited: bool,
    ) -> Result<(), StoreError>;

    /// Whether any request made at or after `since` was rate limited.
    async fn rate_limited_since(&self, since: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Number of requests made at or after `since`.
    async fn requests_since(&self, since: DateTime<Utc>) -> Result<i64, StoreError>;

    async fn last_request_at(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Most recent fetch of exactly this station and window.
    async fn latest_window(
        &self,
        station_id: Uuid,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Option<FetchWindow>, StoreError>;

    async fn record_window(
        &self,
        station_id: Uuid,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        fetched_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

/// Lookup of weather stations.
#[async_trait]
pub trait StationDirectory: Send + Sync {
    /// Up to `max_results` stations ordered by great-circle distance.
    async fn nearby_stations(
        &self,
        latitude: f64,
        longitude: f64,
        max_results: usize,
    ) -> Result<Vec<Station>, StoreError>;

    /// Id of the station with this code, creating a placeholder station
    /// without coordinates when the code is unknown.
    async fn station_id_for_code(&self, code: &str) -> Result<Uuid, StoreError>;
}

/// The ride log as seen by the weather pipeline.
#[async_trait]
pub trait RideRepository: Send + Sync {
    async fn load_ride(&self, ride_id: Uuid) -> Result<Option<RideRecord>, StoreError>;

    /// Cache a resolved IANA zone on a location.
    async fn cache_timezone(&self, location_id: Uuid, timezone: &str) -> Result<(), StoreError>;

    /// Replace the ride's weather record. Null fields overwrite stored values.
    async fn write_weather(&self, ride_id: Uuid, weather: &AveragedWeather)
        -> Result<(), StoreError>;

    async fn ride_weather(&self, ride_id: Uuid) -> Result<Option<AveragedWeather>, StoreError>;

    /// Rides with no weather record yet.
    async fn rides_missing_weather(&self) -> Result<Vec<Uuid>, StoreError>;
}
