//! Choosing the weather station for a ride.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::db::models::{Station, WeatherObservation};
use crate::db::store::StationDirectory;
use crate::errors::FetchError;
use crate::services::observation_cache::{spans_interval, StationObservationCache};

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance between two points given in degrees.
pub fn great_circle_distance_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let delta_lambda = (lon2 - lon1).to_radians();
    let cosine = phi1.cos() * phi2.cos() * delta_lambda.cos() + phi1.sin() * phi2.sin();
    EARTH_RADIUS_KM * cosine.clamp(-1.0, 1.0).acos()
}

/// A station whose reports bracket the requested interval.
#[derive(Debug, Clone)]
pub struct CoveringStation {
    pub station: Station,
    /// Reports around the interval, ascending.
    pub observations: Vec<WeatherObservation>,
}

#[derive(Clone)]
pub struct StationSelector {
    stations: Arc<dyn StationDirectory>,
    cache: StationObservationCache,
    max_results: usize,
}

impl StationSelector {
    pub fn new(
        stations: Arc<dyn StationDirectory>,
        cache: StationObservationCache,
        max_results: usize,
    ) -> Self {
        Self {
            stations,
            cache,
            max_results,
        }
    }

    /// Nearest station, among the closest `max_results`, with reports at or
    /// before `start` and at or after `end`.
    ///
    /// Stations are tried strictly in distance order. Fetch failures are not
    /// skipped over: a rate-limited upstream aborts the search so that the
    /// caller can retry later instead of settling for a farther station.
    pub async fn find_covering_station(
        &self,
        latitude: f64,
        longitude: f64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Option<CoveringStation>, FetchError> {
        let candidates = self
            .stations
            .nearby_stations(latitude, longitude, self.max_results)
            .await?;

        for station in candidates {
            let observations = self.cache.observations_for(&station, start, end).await?;
            if spans_interval(&observations, start, end) {
                tracing::info!(
                    "Selected station {} ({:.1} km away, {} reports)",
                    station.code,
                    great_circle_distance_km(latitude, longitude, station.latitude, station.longitude),
                    observations.len()
                );
                return Ok(Some(CoveringStation {
                    station,
                    observations,
                }));
            }
            tracing::debug!(
                "Station {} does not cover {} to {}, trying next",
                station.code,
                start,
                end
            );
        }

        tracing::warn!(
            "No station within {} candidates covers {} to {} near ({}, {})",
            self.max_results,
            start,
            end,
            latitude,
            longitude
        );
        Ok(None)
    }
}
