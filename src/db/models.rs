use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

/// A named geographic point. Ride endpoints and weather stations share this
/// table and are told apart by their `kind` column.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct Location {
    pub id: Uuid,
    pub name: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub elevation_m: Option<f64>,
    /// IANA zone name, cached after the first resolution.
    pub timezone: Option<String>,
}

/// A weather station with known coordinates.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct Station {
    pub id: Uuid,
    /// ICAO identifier, e.g. `KDCA`.
    pub code: String,
    pub latitude: f64,
    pub longitude: f64,
    pub elevation_m: Option<f64>,
}

/// Intensity qualifier of a present-weather group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intensity {
    Light,
    Moderate,
    Heavy,
    /// Observed in the vicinity, not at the station.
    Vicinity,
}

/// One present-weather group of a report, e.g. `-SHRA`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherPhenomenon {
    pub intensity: Intensity,
    /// Two-letter descriptor such as `SH`, `TS` or `FZ`.
    pub descriptor: Option<String>,
    /// Two-letter phenomenon codes such as `RA`, `SN` or `BR`.
    pub codes: Vec<String>,
}

/// A decoded report ready to be persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewObservation {
    pub station_id: Uuid,
    pub report_time: DateTime<Utc>,
    pub raw_text: String,
    pub wind_speed_mph: Option<f64>,
    pub wind_direction_deg: Option<f64>,
    pub gust_mph: Option<f64>,
    pub temperature_c: Option<f64>,
    pub dew_point_c: Option<f64>,
    pub pressure_hpa: Option<f64>,
    pub weather: Vec<WeatherPhenomenon>,
    pub parse_error: bool,
}

/// A persisted weather report. Unique per (station, report time, raw text).
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct WeatherObservation {
    pub id: Uuid,
    pub station_id: Uuid,
    pub report_time: DateTime<Utc>,
    pub raw_text: String,
    pub wind_speed_mph: Option<f64>,
    pub wind_direction_deg: Option<f64>,
    pub gust_mph: Option<f64>,
    pub temperature_c: Option<f64>,
    pub dew_point_c: Option<f64>,
    pub pressure_hpa: Option<f64>,
    #[sqlx(json)]
    pub weather: Vec<WeatherPhenomenon>,
    pub parse_error: bool,
}

impl WeatherObservation {
    pub fn from_new(id: Uuid, new: NewObservation) -> Self {
        Self {
            id,
            station_id: new.station_id,
            report_time: new.report_time,
            raw_text: new.raw_text,
            wind_speed_mph: new.wind_speed_mph,
            wind_direction_deg: new.wind_direction_deg,
            gust_mph: new.gust_mph,
            temperature_c: new.temperature_c,
            dew_point_c: new.dew_point_c,
            pressure_hpa: new.pressure_hpa,
            weather: new.weather,
            parse_error: new.parse_error,
        }
    }
}

/// One outbound request to the upstream weather source.
#[derive(Debug, Clone, Serialize, FromRow, ToSchema)]
pub struct FetchRecord {
    pub id: Uuid,
    pub url: String,
    pub requested_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status_code: Option<i32>,
    pub rate_limited: bool,
}

/// Record of a completed fetch of one station's reports over one window.
#[derive(Debug, Clone, FromRow)]
#[allow(dead_code)]
pub struct FetchWindow {
    pub id: Uuid,
    pub station_id: Uuid,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
}

/// Start or end of a ride as recorded in the log.
#[derive(Debug, Clone, Default)]
pub struct RideEndpoint {
    /// Naive local wall-clock time.
    pub time: Option<NaiveDateTime>,
    pub location: Option<Location>,
}

/// The parts of a ride the weather pipeline reads.
#[derive(Debug, Clone)]
pub struct RideRecord {
    pub id: Uuid,
    pub start: RideEndpoint,
    pub end: RideEndpoint,
}

/// Flat row of a ride joined with both endpoint locations.
#[derive(Debug, Clone, FromRow)]
pub struct RideRow {
    pub id: Uuid,
    pub start_time: Option<NaiveDateTime>,
    pub end_time: Option<NaiveDateTime>,
    pub start_location_id: Option<Uuid>,
    pub start_name: Option<String>,
    pub start_latitude: Option<f64>,
    pub start_longitude: Option<f64>,
    pub start_elevation_m: Option<f64>,
    pub start_timezone: Option<String>,
    pub end_location_id: Option<Uuid>,
    pub end_name: Option<String>,
    pub end_latitude: Option<f64>,
    pub end_longitude: Option<f64>,
    pub end_elevation_m: Option<f64>,
    pub end_timezone: Option<String>,
}

impl From<RideRow> for RideRecord {
    fn from(row: RideRow) -> Self {
        let start_location = row.start_location_id.map(|id| Location {
            id,
            name: row.start_name.unwrap_or_default(),
            latitude: row.start_latitude,
            longitude: row.start_longitude,
            elevation_m: row.start_elevation_m,
            timezone: row.start_timezone,
        });
        let end_location = row.end_location_id.map(|id| Location {
            id,
            name: row.end_name.unwrap_or_default(),
            latitude: row.end_latitude,
            longitude: row.end_longitude,
            elevation_m: row.end_elevation_m,
            timezone: row.end_timezone,
        });
        Self {
            id: row.id,
            start: RideEndpoint {
                time: row.start_time,
                location: start_location,
            },
            end: RideEndpoint {
                time: row.end_time,
                location: end_location,
            },
        }
    }
}

/// Weather averaged over a ride, as written to the ride's weather record.
/// Every field except the station may be null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow, ToSchema)]
pub struct AveragedWeather {
    pub station_id: Uuid,
    pub temperature_c: Option<f64>,
    pub dew_point_c: Option<f64>,
    pub pressure_hpa: Option<f64>,
    pub wind_speed_mph: Option<f64>,
    /// Degrees clockwise from north, `[0, 360)`.
    pub wind_direction_deg: Option<f64>,
    pub gust_mph: Option<f64>,
    /// Fraction in `[0, 1]`, derived from temperature and dew point.
    pub relative_humidity: Option<f64>,
    /// Rain-equivalent index.
    pub rain: Option<f64>,
    /// Snow-equivalent index.
    pub snow: Option<f64>,
}

/// Upstream request statistics over a trailing window.
#[derive(Debug, Clone, Serialize, FromRow, ToSchema)]
pub struct RequestStats {
    pub total: i64,
    pub rate_limited: i64,
    pub last_request_at: Option<DateTime<Utc>>,
    pub last_rate_limited_at: Option<DateTime<Utc>>,
}
