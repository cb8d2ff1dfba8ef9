use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use super::models::{
    AveragedWeather, FetchRecord, FetchWindow, NewObservation, RequestStats, RideRecord, RideRow,
    Station, WeatherObservation,
};
use super::store::{FetchLedger, ObservationStore, RideRepository, StationDirectory};
use crate::errors::StoreError;

/// Location `kind` tag of weather stations.
const STATION_KIND: &str = "weather_station";

/// Postgres implementation of every persistence seam.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ObservationStore for PgStore {
    async fn get_or_insert(
        &self,
        observation: NewObservation,
    ) -> Result<WeatherObservation, StoreError> {
        let inserted = sqlx::query_as::<_, WeatherObservation>(
            "INSERT INTO weather_observations
                (id, station_id, report_time, raw_text, wind_speed_mph, wind_direction_deg,
                 gust_mph, temperature_c, dew_point_c, pressure_hpa, weather, parse_error)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             ON CONFLICT (station_id, report_time, raw_text) DO NOTHING
             RETURNING id, station_id, report_time, raw_text, wind_speed_mph, wind_direction_deg,
                       gust_mph, temperature_c, dew_point_c, pressure_hpa, weather, parse_error",
        )
        .bind(Uuid::new_v4())
        .bind(observation.station_id)
        .bind(observation.report_time)
        .bind(&observation.raw_text)
        .bind(observation.wind_speed_mph)
        .bind(observation.wind_direction_deg)
        .bind(observation.gust_mph)
        .bind(observation.temperature_c)
        .bind(observation.dew_point_c)
        .bind(observation.pressure_hpa)
        .bind(Json(&observation.weather))
        .bind(observation.parse_error)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(row);
        }

        // Already stored: return the existing row untouched.
        let existing = sqlx::query_as::<_, WeatherObservation>(
            "SELECT id, station_id, report_time, raw_text, wind_speed_mph, wind_direction_deg,
                    gust_mph, temperature_c, dew_point_c, pressure_hpa, weather, parse_error
             FROM weather_observations
             WHERE station_id = $1 AND report_time = $2 AND raw_text = $3",
        )
        .bind(observation.station_id)
        .bind(observation.report_time)
        .bind(&observation.raw_text)
        .fetch_one(&self.pool)
        .await?;
        Ok(existing)
    }

    async fn query_range(
        &self,
        station_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<WeatherObservation>, StoreError> {
        let rows = sqlx::query_as::<_, WeatherObservation>(
            "SELECT id, station_id, report_time, raw_text, wind_speed_mph, wind_direction_deg,
                    gust_mph, temperature_c, dew_point_c, pressure_hpa, weather, parse_error
             FROM weather_observations
             WHERE station_id = $1 AND report_time >= $2 AND report_time <= $3
             ORDER BY report_time, id",
        )
        .bind(station_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl FetchLedger for PgStore {
    async fn begin_request(
        &self,
        url: &str,
        requested_at: DateTime<Utc>,
    ) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO fetch_requests (id, url, requested_at) VALUES ($1, $2, $3)")
            .bind(id)
            .bind(url)
            .bind(requested_at)
            .execute(&self.pool)
            .await?;
        Ok(id)
    }

    async fn finish_request(
        &self,
        id: Uuid,
        status_code: Option<i32>,
        rate_limited: bool,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE fetch_requests
             SET completed_at = NOW(), status_code = $2, rate_limited = $3
             WHERE id = $1",
        )
        .bind(id)
        .bind(status_code)
        .bind(rate_limited)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn rate_limited_since(&self, since: DateTime<Utc>) -> Result<bool, StoreError> {
        let limited = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (
                SELECT 1 FROM fetch_requests WHERE rate_limited AND requested_at >= $1
             )",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(limited)
    }

    async fn requests_since(&self, since: DateTime<Utc>) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM fetch_requests WHERE requested_at >= $1",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn last_request_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let last = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT MAX(requested_at) FROM fetch_requests",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(last)
    }

    async fn latest_window(
        &self,
        station_id: Uuid,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Option<FetchWindow>, StoreError> {
        let window = sqlx::query_as::<_, FetchWindow>(
            "SELECT id, station_id, window_start, window_end, fetched_at
             FROM fetch_windows
             WHERE station_id = $1 AND window_start = $2 AND window_end = $3
             ORDER BY fetched_at DESC
             LIMIT 1",
        )
        .bind(station_id)
        .bind(window_start)
        .bind(window_end)
        .fetch_optional(&self.pool)
        .await?;
        Ok(window)
    }

    async fn record_window(
        &self,
        station_id: Uuid,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        fetched_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO fetch_windows (id, station_id, window_start, window_end, fetched_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(Uuid::new_v4())
        .bind(station_id)
        .bind(window_start)
        .bind(window_end)
        .bind(fetched_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl StationDirectory for PgStore {
    async fn nearby_stations(
        &self,
        latitude: f64,
        longitude: f64,
        max_results: usize,
    ) -> Result<Vec<Station>, StoreError> {
        // Spherical law of cosines; the argument is clamped so rounding can
        // never push ACOS outside its domain.
        let stations = sqlx::query_as::<_, Station>(
            "SELECT id, code, latitude, longitude, elevation_m
             FROM (
                SELECT id, name AS code, latitude, longitude, elevation_m,
                       6371.0 * ACOS(LEAST(1.0, GREATEST(-1.0,
                           COS(RADIANS($1)) * COS(RADIANS(latitude))
                               * COS(RADIANS(longitude) - RADIANS($2))
                           + SIN(RADIANS($1)) * SIN(RADIANS(latitude))
                       ))) AS distance_km
                FROM locations
                WHERE kind = $3 AND latitude IS NOT NULL AND longitude IS NOT NULL
             ) ranked
             ORDER BY distance_km, code
             LIMIT $4",
        )
        .bind(latitude)
        .bind(longitude)
        .bind(STATION_KIND)
        .bind(max_results as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(stations)
    }

    async fn station_id_for_code(&self, code: &str) -> Result<Uuid, StoreError> {
        let existing = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM locations WHERE kind = $1 AND name = $2 LIMIT 1",
        )
        .bind(STATION_KIND)
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(id) = existing {
            return Ok(id);
        }

        tracing::info!("Creating placeholder station for unknown code {}", code);
        let created = sqlx::query_scalar::<_, Uuid>(
            "INSERT INTO locations (id, name, kind) VALUES ($1, $2, $3)
             ON CONFLICT (name) WHERE kind = 'weather_station' DO NOTHING
             RETURNING id",
        )
        .bind(Uuid::new_v4())
        .bind(code)
        .bind(STATION_KIND)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(id) = created {
            return Ok(id);
        }

        // Lost a race with a concurrent insert.
        let id = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM locations WHERE kind = $1 AND name = $2 LIMIT 1",
        )
        .bind(STATION_KIND)
        .bind(code)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }
}

#[async_trait]
impl RideRepository for PgStore {
    async fn load_ride(&self, ride_id: Uuid) -> Result<Option<RideRecord>, StoreError> {
        let row = sqlx::query_as::<_, RideRow>(
            "SELECT r.id, r.start_time, r.end_time,
                    sl.id AS start_location_id, sl.name AS start_name,
                    sl.latitude AS start_latitude, sl.longitude AS start_longitude,
                    sl.elevation_m AS start_elevation_m, sl.timezone AS start_timezone,
                    el.id AS end_location_id, el.name AS end_name,
                    el.latitude AS end_latitude, el.longitude AS end_longitude,
                    el.elevation_m AS end_elevation_m, el.timezone AS end_timezone
             FROM rides r
             LEFT JOIN locations sl ON sl.id = r.start_location_id
             LEFT JOIN locations el ON el.id = r.end_location_id
             WHERE r.id = $1",
        )
        .bind(ride_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(RideRecord::from))
    }

    async fn cache_timezone(&self, location_id: Uuid, timezone: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE locations SET timezone = $2 WHERE id = $1")
            .bind(location_id)
            .bind(timezone)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn write_weather(
        &self,
        ride_id: Uuid,
        weather: &AveragedWeather,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO ride_weather
                (id, ride_id, station_id, temperature_c, dew_point_c, pressure_hpa,
                 wind_speed_mph, wind_direction_deg, gust_mph, relative_humidity, rain, snow)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             ON CONFLICT (ride_id) DO UPDATE SET
                station_id = EXCLUDED.station_id,
                temperature_c = EXCLUDED.temperature_c,
                dew_point_c = EXCLUDED.dew_point_c,
                pressure_hpa = EXCLUDED.pressure_hpa,
                wind_speed_mph = EXCLUDED.wind_speed_mph,
                wind_direction_deg = EXCLUDED.wind_direction_deg,
                gust_mph = EXCLUDED.gust_mph,
                relative_humidity = EXCLUDED.relative_humidity,
                rain = EXCLUDED.rain,
                snow = EXCLUDED.snow,
                updated_at = NOW()",
        )
        .bind(Uuid::new_v4())
        .bind(ride_id)
        .bind(weather.station_id)
        .bind(weather.temperature_c)
        .bind(weather.dew_point_c)
        .bind(weather.pressure_hpa)
        .bind(weather.wind_speed_mph)
        .bind(weather.wind_direction_deg)
        .bind(weather.gust_mph)
        .bind(weather.relative_humidity)
        .bind(weather.rain)
        .bind(weather.snow)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn ride_weather(&self, ride_id: Uuid) -> Result<Option<AveragedWeather>, StoreError> {
        let weather = sqlx::query_as::<_, AveragedWeather>(
            "SELECT station_id, temperature_c, dew_point_c, pressure_hpa, wind_speed_mph,
                    wind_direction_deg, gust_mph, relative_humidity, rain, snow
             FROM ride_weather
             WHERE ride_id = $1",
        )
        .bind(ride_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(weather)
    }

    async fn rides_missing_weather(&self) -> Result<Vec<Uuid>, StoreError> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT r.id
             FROM rides r
             LEFT JOIN ride_weather w ON w.ride_id = r.id
             WHERE w.id IS NULL
             ORDER BY r.start_time DESC NULLS LAST",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

/// Aggregate request counts since `since`.
pub async fn request_stats(
    pool: &PgPool,
    since: DateTime<Utc>,
) -> Result<RequestStats, sqlx::Error> {
    sqlx::query_as::<_, RequestStats>(
        "SELECT COUNT(*) AS total,
                COUNT(*) FILTER (WHERE rate_limited) AS rate_limited,
                MAX(requested_at) AS last_request_at,
                MAX(requested_at) FILTER (WHERE rate_limited) AS last_rate_limited_at
         FROM fetch_requests
         WHERE requested_at >= $1",
    )
    .bind(since)
    .fetch_one(pool)
    .await
}

/// Most recent upstream requests, newest first.
pub async fn recent_requests(pool: &PgPool, limit: i64) -> Result<Vec<FetchRecord>, sqlx::Error> {
    sqlx::query_as::<_, FetchRecord>(
        "SELECT id, url, requested_at, completed_at, status_code, rate_limited
         FROM fetch_requests
         ORDER BY requested_at DESC
         LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
}
