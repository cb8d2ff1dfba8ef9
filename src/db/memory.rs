//! In-memory implementations of the persistence seams, for tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use uuid::Uuid;

use super::models::{
    AveragedWeather, FetchRecord, FetchWindow, Location, NewObservation, RideEndpoint, RideRecord,
    Station, WeatherObservation,
};
use super::store::{FetchLedger, ObservationStore, RideRepository, StationDirectory};
use crate::errors::StoreError;
use crate::services::stations::great_circle_distance_km;

#[derive(Debug, Clone)]
struct StationEntry {
    id: Uuid,
    code: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
    elevation_m: Option<f64>,
}

#[derive(Debug, Clone)]
struct RideEntry {
    start_time: Option<NaiveDateTime>,
    end_time: Option<NaiveDateTime>,
    start_location: Option<Uuid>,
    end_location: Option<Uuid>,
}

#[derive(Debug, Default)]
struct Inner {
    stations: Vec<StationEntry>,
    locations: HashMap<Uuid, Location>,
    rides: HashMap<Uuid, RideEntry>,
    observations: Vec<WeatherObservation>,
    requests: Vec<FetchRecord>,
    windows: Vec<FetchWindow>,
    weather: HashMap<Uuid, AveragedWeather>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_station(&self, code: &str, latitude: f64, longitude: f64, elevation_m: f64) -> Uuid {
        let id = Uuid::new_v4();
        self.inner.lock().unwrap().stations.push(StationEntry {
            id,
            code: code.to_string(),
            latitude: Some(latitude),
            longitude: Some(longitude),
            elevation_m: Some(elevation_m),
        });
        id
    }

    pub fn add_location(
        &self,
        name: &str,
        latitude: Option<f64>,
        longitude: Option<f64>,
        elevation_m: Option<f64>,
        timezone: Option<&str>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        self.inner.lock().unwrap().locations.insert(
            id,
            Location {
                id,
                name: name.to_string(),
                latitude,
                longitude,
                elevation_m,
                timezone: timezone.map(str::to_string),
            },
        );
        id
    }

    pub fn add_ride(
        &self,
        start_time: Option<NaiveDateTime>,
        end_time: Option<NaiveDateTime>,
        start_location: Option<Uuid>,
        end_location: Option<Uuid>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        self.inner.lock().unwrap().rides.insert(
            id,
            RideEntry {
                start_time,
                end_time,
                start_location,
                end_location,
            },
        );
        id
    }

    /// Seed the ledger with a completed request.
    pub fn push_request(&self, requested_at: DateTime<Utc>, rate_limited: bool) {
        self.inner.lock().unwrap().requests.push(FetchRecord {
            id: Uuid::new_v4(),
            url: "http://seeded".to_string(),
            requested_at,
            completed_at: Some(requested_at),
            status_code: Some(200),
            rate_limited,
        });
    }

    pub fn requests(&self) -> Vec<FetchRecord> {
        self.inner.lock().unwrap().requests.clone()
    }

    pub fn windows(&self) -> Vec<FetchWindow> {
        self.inner.lock().unwrap().windows.clone()
    }

    pub fn observation_count(&self) -> usize {
        self.inner.lock().unwrap().observations.len()
    }

    pub fn location(&self, id: Uuid) -> Option<Location> {
        self.inner.lock().unwrap().locations.get(&id).cloned()
    }

    pub fn station_codes(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.stations.iter().map(|s| s.code.clone()).collect()
    }
}

#[async_trait]
impl ObservationStore for MemoryStore {
    async fn get_or_insert(
        &self,
        observation: NewObservation,
    ) -> Result<WeatherObservation, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.observations.iter().find(|o| {
            o.station_id == observation.station_id
                && o.report_time == observation.report_time
                && o.raw_text == observation.raw_text
        }) {
            return Ok(existing.clone());
        }
        let stored = WeatherObservation::from_new(Uuid::new_v4(), observation);
        inner.observations.push(stored.clone());
        Ok(stored)
    }

    async fn query_range(
        &self,
        station_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<WeatherObservation>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<WeatherObservation> = inner
            .observations
            .iter()
            .filter(|o| o.station_id == station_id && o.report_time >= start && o.report_time <= end)
            .cloned()
            .collect();
        rows.sort_by_key(|o| o.report_time);
        Ok(rows)
    }
}

#[async_trait]
impl FetchLedger for MemoryStore {
    async fn begin_request(
        &self,
        url: &str,
        requested_at: DateTime<Utc>,
    ) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        self.inner.lock().unwrap().requests.push(FetchRecord {
            id,
            url: url.to_string(),
            requested_at,
            completed_at: None,
            status_code: None,
            rate_limited: false,
        });
        Ok(id)
    }

    async fn finish_request(
        &self,
        id: Uuid,
        status_code: Option<i32>,
        rate_limited: bool,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.requests.iter_mut().find(|r| r.id == id) {
            record.completed_at = Some(Utc::now());
            record.status_code = status_code;
            record.rate_limited = rate_limited;
        }
        Ok(())
    }

    async fn rate_limited_since(&self, since: DateTime<Utc>) -> Result<bool, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .requests
            .iter()
            .any(|r| r.rate_limited && r.requested_at >= since))
    }

    async fn requests_since(&self, since: DateTime<Utc>) -> Result<i64, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.requests.iter().filter(|r| r.requested_at >= since).count() as i64)
    }

    async fn last_request_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.requests.iter().map(|r| r.requested_at).max())
    }

    async fn latest_window(
        &self,
        station_id: Uuid,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Option<FetchWindow>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .windows
            .iter()
            .filter(|w| {
                w.station_id == station_id
                    && w.window_start == window_start
                    && w.window_end == window_end
            })
            .max_by_key(|w| w.fetched_at)
            .cloned())
    }

    async fn record_window(
        &self,
        station_id: Uuid,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        fetched_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.inner.lock().unwrap().windows.push(FetchWindow {
            id: Uuid::new_v4(),
            station_id,
            window_start,
            window_end,
            fetched_at,
        });
        Ok(())
    }
}

#[async_trait]
impl StationDirectory for MemoryStore {
    async fn nearby_stations(
        &self,
        latitude: f64,
        longitude: f64,
        max_results: usize,
    ) -> Result<Vec<Station>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut ranked: Vec<(f64, Station)> = inner
            .stations
            .iter()
            .filter_map(|s| {
                let (lat, lon) = (s.latitude?, s.longitude?);
                let station = Station {
                    id: s.id,
                    code: s.code.clone(),
                    latitude: lat,
                    longitude: lon,
                    elevation_m: s.elevation_m,
                };
                Some((great_circle_distance_km(latitude, longitude, lat, lon), station))
            })
            .collect();
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.code.cmp(&b.1.code)));
        Ok(ranked
            .into_iter()
            .take(max_results)
            .map(|(_, station)| station)
            .collect())
    }

    async fn station_id_for_code(&self, code: &str) -> Result<Uuid, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.stations.iter().find(|s| s.code == code) {
            return Ok(existing.id);
        }
        let id = Uuid::new_v4();
        inner.stations.push(StationEntry {
            id,
            code: code.to_string(),
            latitude: None,
            longitude: None,
            elevation_m: None,
        });
        Ok(id)
    }
}

#[async_trait]
impl RideRepository for MemoryStore {
    async fn load_ride(&self, ride_id: Uuid) -> Result<Option<RideRecord>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let Some(entry) = inner.rides.get(&ride_id) else {
            return Ok(None);
        };
        let location = |id: Option<Uuid>| id.and_then(|id| inner.locations.get(&id).cloned());
        Ok(Some(RideRecord {
            id: ride_id,
            start: RideEndpoint {
                time: entry.start_time,
                location: location(entry.start_location),
            },
            end: RideEndpoint {
                time: entry.end_time,
                location: location(entry.end_location),
            },
        }))
    }

    async fn cache_timezone(&self, location_id: Uuid, timezone: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(location) = inner.locations.get_mut(&location_id) {
            location.timezone = Some(timezone.to_string());
        }
        Ok(())
    }

    async fn write_weather(
        &self,
        ride_id: Uuid,
        weather: &AveragedWeather,
    ) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .weather
            .insert(ride_id, weather.clone());
        Ok(())
    }

    async fn ride_weather(&self, ride_id: Uuid) -> Result<Option<AveragedWeather>, StoreError> {
        Ok(self.inner.lock().unwrap().weather.get(&ride_id).cloned())
    }

    async fn rides_missing_weather(&self) -> Result<Vec<Uuid>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut ids: Vec<Uuid> = inner
            .rides
            .keys()
            .filter(|id| !inner.weather.contains_key(id))
            .copied()
            .collect();
        ids.sort();
        Ok(ids)
    }
}
