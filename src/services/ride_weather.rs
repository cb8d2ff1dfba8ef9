//! Ride weather orchestration.
//!
//! Turns a logged ride into a UTC interval at a single point, picks the
//! nearest station whose reports bracket that interval, averages the
//! reports and stores the result on the ride. A ride without complete time
//! and coordinate data is left alone; that is the normal state of a freshly
//! entered ride, not an error.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use tzf_rs::DefaultFinder;
use uuid::Uuid;

use crate::db::models::{AveragedWeather, Location, RideEndpoint};
use crate::db::store::RideRepository;
use crate::errors::{StoreError, WeatherError};
use crate::services::averaging::{self, AltitudeCorrection};
use crate::services::stations::StationSelector;

/// Maps coordinates to an IANA timezone.
pub trait TimezoneResolver: Send + Sync {
    fn resolve(&self, latitude: f64, longitude: f64) -> Option<Tz>;
}

/// Looks zones up in the bundled timezone boundary polygons.
pub struct CoordinateTimezoneResolver {
    finder: DefaultFinder,
}

impl CoordinateTimezoneResolver {
    pub fn new() -> Self {
        Self {
            finder: DefaultFinder::new(),
        }
    }
}

impl Default for CoordinateTimezoneResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl TimezoneResolver for CoordinateTimezoneResolver {
    fn resolve(&self, latitude: f64, longitude: f64) -> Option<Tz> {
        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            return None;
        }
        let name = self.finder.get_tz_name(longitude, latitude);
        if name.is_empty() {
            return None;
        }
        match name.parse::<Tz>() {
            Ok(tz) => Some(tz),
            Err(_) => {
                tracing::warn!("Boundary data names unknown zone '{}'", name);
                None
            }
        }
    }
}

/// Resolves every coordinate to one zone.
#[cfg(test)]
#[derive(Debug, Clone, Copy)]
pub struct FixedTimezoneResolver(pub Tz);

#[cfg(test)]
impl TimezoneResolver for FixedTimezoneResolver {
    fn resolve(&self, _latitude: f64, _longitude: f64) -> Option<Tz> {
        Some(self.0)
    }
}

/// Asks the downstream model to retrain after ride weather changed.
#[async_trait]
pub trait RetrainTrigger: Send + Sync {
    async fn retrain(&self) -> Result<(), reqwest::Error>;
}

/// POSTs to a retraining endpoint.
#[derive(Debug, Clone)]
pub struct HttpRetrainTrigger {
    client: reqwest::Client,
    url: String,
}

impl HttpRetrainTrigger {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl RetrainTrigger for HttpRetrainTrigger {
    async fn retrain(&self) -> Result<(), reqwest::Error> {
        self.client
            .post(&self.url)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Used when no retraining endpoint is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRetrainTrigger;

#[async_trait]
impl RetrainTrigger for NoopRetrainTrigger {
    async fn retrain(&self) -> Result<(), reqwest::Error> {
        tracing::debug!("Retraining requested but no endpoint is configured");
        Ok(())
    }
}

/// A ride reduced to what the averager needs.
#[derive(Debug, Clone, PartialEq)]
pub struct RideInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    /// Mean of the known endpoint elevations.
    pub elevation_m: Option<f64>,
}

struct ResolvedEndpoint {
    time: DateTime<Utc>,
    latitude: f64,
    longitude: f64,
    elevation_m: Option<f64>,
}

/// Result of a single ride update.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Updated(AveragedWeather),
    /// Missing times, coordinates or timezone; nothing was done.
    IncompleteRide,
    /// No nearby station brackets the ride; stored weather is untouched.
    NoCoveringStation,
}

#[derive(Clone)]
pub struct RideWeatherService {
    rides: Arc<dyn RideRepository>,
    selector: StationSelector,
    timezones: Arc<dyn TimezoneResolver>,
    fallback_timezone: Option<Tz>,
    retrain: Arc<dyn RetrainTrigger>,
}

impl RideWeatherService {
    pub fn new(
        rides: Arc<dyn RideRepository>,
        selector: StationSelector,
        timezones: Arc<dyn TimezoneResolver>,
        retrain: Arc<dyn RetrainTrigger>,
    ) -> Self {
        Self {
            rides,
            selector,
            timezones,
            fallback_timezone: None,
            retrain,
        }
    }

    /// Zone used for coordinates the resolver cannot place. It is never
    /// cached on the location.
    pub fn with_fallback_timezone(mut self, tz: Option<Tz>) -> Self {
        self.fallback_timezone = tz;
        self
    }

    /// Recompute and store the weather of one ride, without retraining.
    pub async fn refresh(&self, ride_id: Uuid) -> Result<UpdateOutcome, WeatherError> {
        let ride = self
            .rides
            .load_ride(ride_id)
            .await?
            .ok_or(WeatherError::RideNotFound(ride_id))?;

        let Some(interval) = self.ride_interval(&ride.start, &ride.end).await? else {
            tracing::debug!("Ride {}: incomplete time or location data, skipping", ride_id);
            return Ok(UpdateOutcome::IncompleteRide);
        };

        let Some(covering) = self
            .selector
            .find_covering_station(interval.latitude, interval.longitude, interval.start, interval.end)
            .await?
        else {
            return Ok(UpdateOutcome::NoCoveringStation);
        };

        let correction = AltitudeCorrection {
            station_elevation_m: covering.station.elevation_m,
            target_elevation_m: interval.elevation_m,
        };
        let weather = averaging::average(
            &covering.observations,
            interval.start,
            interval.end,
            correction,
        )?;
        self.rides.write_weather(ride_id, &weather).await?;

        tracing::info!(
            "Ride {}: weather from {} ({:?} °C, {:?} hPa)",
            ride_id,
            covering.station.code,
            weather.temperature_c,
            weather.pressure_hpa
        );
        Ok(UpdateOutcome::Updated(weather))
    }

    /// [`refresh`](Self::refresh), then retrain if the ride was updated.
    pub async fn update(&self, ride_id: Uuid) -> Result<UpdateOutcome, WeatherError> {
        let outcome = self.refresh(ride_id).await?;
        if matches!(outcome, UpdateOutcome::Updated(_)) {
            self.trigger_retrain();
        }
        Ok(outcome)
    }

    /// Fire-and-forget retraining; failures are only logged.
    pub fn trigger_retrain(&self) {
        let retrain = self.retrain.clone();
        tokio::spawn(async move {
            if let Err(e) = retrain.retrain().await {
                tracing::warn!("Retraining trigger failed: {}", e);
            }
        });
    }

    pub async fn ride_exists(&self, ride_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.rides.load_ride(ride_id).await?.is_some())
    }

    pub async fn rides_missing_weather(&self) -> Result<Vec<Uuid>, StoreError> {
        self.rides.rides_missing_weather().await
    }

    pub async fn ride_weather(&self, ride_id: Uuid) -> Result<Option<AveragedWeather>, StoreError> {
        self.rides.ride_weather(ride_id).await
    }

    /// UTC interval, midpoint and mean elevation of a ride, if derivable.
    pub async fn ride_interval(
        &self,
        start: &RideEndpoint,
        end: &RideEndpoint,
    ) -> Result<Option<RideInterval>, StoreError> {
        let Some(start) = self.resolve_endpoint(start).await? else {
            return Ok(None);
        };
        let Some(end) = self.resolve_endpoint(end).await? else {
            return Ok(None);
        };
        if end.time <= start.time {
            tracing::warn!("Ride ends at {} before it starts at {}", end.time, start.time);
            return Ok(None);
        }

        let elevation_m = match (start.elevation_m, end.elevation_m) {
            (Some(a), Some(b)) => Some((a + b) / 2.0),
            (Some(e), None) | (None, Some(e)) => Some(e),
            (None, None) => None,
        };
        Ok(Some(RideInterval {
            start: start.time,
            end: end.time,
            latitude: (start.latitude + end.latitude) / 2.0,
            longitude: (start.longitude + end.longitude) / 2.0,
            elevation_m,
        }))
    }

    async fn resolve_endpoint(
        &self,
        endpoint: &RideEndpoint,
    ) -> Result<Option<ResolvedEndpoint>, StoreError> {
        let (Some(local_time), Some(location)) = (endpoint.time, endpoint.location.as_ref()) else {
            return Ok(None);
        };
        let (Some(latitude), Some(longitude)) = (location.latitude, location.longitude) else {
            return Ok(None);
        };
        let Some(tz) = self.location_timezone(location, latitude, longitude).await? else {
            tracing::warn!("No timezone for location '{}'", location.name);
            return Ok(None);
        };
        let Some(time) = to_utc(tz, local_time) else {
            tracing::warn!(
                "Local time {} does not exist in {} at '{}'",
                local_time,
                tz.name(),
                location.name
            );
            return Ok(None);
        };
        Ok(Some(ResolvedEndpoint {
            time,
            latitude,
            longitude,
            elevation_m: location.elevation_m.filter(|e| e.is_finite()),
        }))
    }

    /// Cached zone of a location, resolving and caching it on first use.
    async fn location_timezone(
        &self,
        location: &Location,
        latitude: f64,
        longitude: f64,
    ) -> Result<Option<Tz>, StoreError> {
        if let Some(name) = location.timezone.as_deref() {
            match name.parse::<Tz>() {
                Ok(tz) => return Ok(Some(tz)),
                Err(_) => tracing::warn!(
                    "Ignoring unknown cached timezone '{}' on '{}'",
                    name,
                    location.name
                ),
            }
        }
        let Some(tz) = self.timezones.resolve(latitude, longitude) else {
            if let Some(fallback) = self.fallback_timezone {
                tracing::debug!(
                    "No zone at '{}' ({}, {}), assuming {}",
                    location.name,
                    latitude,
                    longitude,
                    fallback.name()
                );
            }
            return Ok(self.fallback_timezone);
        };
        self.rides.cache_timezone(location.id, tz.name()).await?;
        Ok(Some(tz))
    }
}

/// Attach `tz` to a naive local time. Ambiguous times take the earlier
/// instant; times skipped by a DST jump have no UTC value.
pub fn to_utc(tz: Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&local)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}
