//! ogimet METAR listing client.
//!
//! Fetches one station-day of reports per request from ogimet's plain-text
//! listing endpoint. The upstream enforces an undocumented quota, so every
//! request is gated by the request ledger before anything goes over the
//! wire:
//!
//! - no request while a rate-limited response is younger than the cooldown
//! - no more than the configured number of requests per rolling window
//! - minimum spacing between requests for old ("slow") data
//!
//! A refused or quota-exhausted request surfaces as
//! [`FetchError::RateLimited`] with a log-normally jittered retry delay, so
//! that many refused jobs do not all come back at once.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Timelike, Utc};
use rand_distr::{Distribution, LogNormal};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{StatusCode, Url};

use crate::config::{OgimetConfig, RateLimitConfig};
use crate::db::models::{Station, WeatherObservation};
use crate::db::store::{FetchLedger, ObservationStore, StationDirectory};
use crate::errors::FetchError;
use crate::services::metar;

/// METAR report type code of the listing endpoint.
const REPORT_TYPE_METAR: &str = "SA";

/// Source of one station-day of reports.
#[async_trait]
pub trait ReportFetcher: Send + Sync {
    /// Fetch, decode and persist every report of `station` between
    /// `day_start` and `day_end` (same UTC day). Returns the stored rows.
    async fn fetch_day(
        &self,
        station: &Station,
        day_start: DateTime<Utc>,
        day_end: DateTime<Utc>,
    ) -> Result<Vec<WeatherObservation>, FetchError>;
}

/// Client for the ogimet METAR listing.
#[derive(Clone)]
pub struct OgimetClient {
    client: reqwest::Client,
    config: OgimetConfig,
    limits: RateLimitConfig,
    ledger: Arc<dyn FetchLedger>,
    store: Arc<dyn ObservationStore>,
    stations: Arc<dyn StationDirectory>,
}

/// Largest multiple of the base a jittered delay may reach.
const MAX_JITTER_FACTOR: f64 = 20.0;

/// A delay drawn from a log-normal distribution with median `base`.
/// An unusable `sigma` yields `base` itself.
pub fn jittered_delay(base: StdDuration, sigma: f64) -> StdDuration {
    if !sigma.is_finite() || sigma < 0.0 {
        return base;
    }
    let factor = LogNormal::new(0.0, sigma)
        .map(|dist| dist.sample(&mut rand::thread_rng()))
        .unwrap_or(1.0)
        .clamp(0.0, MAX_JITTER_FACTOR);
    StdDuration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(base)
}

impl OgimetClient {
    pub fn new(
        config: OgimetConfig,
        limits: RateLimitConfig,
        ledger: Arc<dyn FetchLedger>,
        store: Arc<dyn ObservationStore>,
        stations: Arc<dyn StationDirectory>,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            config,
            limits,
            ledger,
            store,
            stations,
        })
    }

    fn retry_delay(&self) -> StdDuration {
        jittered_delay(self.limits.retry_base, self.limits.retry_sigma)
    }

    /// Refuse the request locally if the ledger says the upstream would.
    async fn check_rate_limits(
        &self,
        day_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), FetchError> {
        if self
            .ledger
            .rate_limited_since(now - self.limits.cooldown)
            .await?
        {
            let retry_after = self.retry_delay();
            tracing::warn!(
                "ogimet: rate limited within the last {} min, retry in {}s",
                self.limits.cooldown.num_minutes(),
                retry_after.as_secs()
            );
            return Err(FetchError::RateLimited { retry_after });
        }

        let recent = self
            .ledger
            .requests_since(now - self.limits.window)
            .await?;
        if recent >= self.limits.max_requests {
            let retry_after = self.retry_delay();
            tracing::warn!(
                "ogimet: {} requests in the last {} min (limit {}), retry in {}s",
                recent,
                self.limits.window.num_minutes(),
                self.limits.max_requests,
                retry_after.as_secs()
            );
            return Err(FetchError::RateLimited { retry_after });
        }

        let slow_query = now - day_start > self.limits.slow_query_age;
        if slow_query {
            if let Some(last) = self.ledger.last_request_at().await? {
                let elapsed = now - last;
                if elapsed < self.limits.min_spacing {
                    let remaining = (self.limits.min_spacing - elapsed)
                        .to_std()
                        .unwrap_or_default();
                    let retry_after = remaining.max(self.retry_delay());
                    tracing::debug!(
                        "ogimet: slow query {}s after previous request, retry in {}s",
                        elapsed.num_seconds(),
                        retry_after.as_secs()
                    );
                    return Err(FetchError::RateLimited { retry_after });
                }
            }
        }

        Ok(())
    }

    /// Listing URL for one station and window.
    pub fn request_url(
        &self,
        station_code: &str,
        day_start: DateTime<Utc>,
        day_end: DateTime<Utc>,
    ) -> Result<Url, FetchError> {
        let params = [
            ("lugar", station_code.to_string()),
            ("tipo", REPORT_TYPE_METAR.to_string()),
            ("ord", "DIR".to_string()),
            ("nil", "NO".to_string()),
            ("fmt", "txt".to_string()),
            ("ano", day_start.year().to_string()),
            ("mes", day_start.month().to_string()),
            ("day", day_start.day().to_string()),
            ("hora", day_start.hour().to_string()),
            ("anof", day_end.year().to_string()),
            ("mesf", day_end.month().to_string()),
            ("dayf", day_end.day().to_string()),
            ("horaf", day_end.hour().to_string()),
            ("minf", day_end.minute().to_string()),
            ("send", "send".to_string()),
        ];
        Url::parse_with_params(&self.config.base_url, &params).map_err(|e| {
            FetchError::Upstream(format!(
                "invalid ogimet base URL '{}': {}",
                self.config.base_url, e
            ))
        })
    }

    fn headers(&self) -> Result<HeaderMap, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&self.config.user_agent)
                .map_err(|e| FetchError::Upstream(format!("Invalid User-Agent: {}", e)))?,
        );
        Ok(headers)
    }

    /// Decode and persist every report of a listing body.
    async fn store_reports(
        &self,
        station: &Station,
        reports: Vec<metar::RawReport>,
    ) -> Result<Vec<WeatherObservation>, FetchError> {
        let mut stored = Vec::with_capacity(reports.len());
        for report in reports {
            let parsed = match metar::parse(
                &report.body,
                report.timestamp.year(),
                report.timestamp.month(),
            ) {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::warn!("ogimet: skipping undecodable report: {}", e);
                    continue;
                }
            };
            let station_id = if parsed.station_code == station.code {
                station.id
            } else {
                self.stations
                    .station_id_for_code(&parsed.station_code)
                    .await?
            };
            stored.push(
                self.store
                    .get_or_insert(parsed.into_observation(station_id))
                    .await?,
            );
        }
        Ok(stored)
    }
}

#[async_trait]
impl ReportFetcher for OgimetClient {
    async fn fetch_day(
        &self,
        station: &Station,
        day_start: DateTime<Utc>,
        day_end: DateTime<Utc>,
    ) -> Result<Vec<WeatherObservation>, FetchError> {
        if day_end < day_start || day_start.date_naive() != day_end.date_naive() {
            return Err(FetchError::InvalidWindow(format!(
                "{} to {} is not within one UTC day",
                day_start, day_end
            )));
        }

        let now = Utc::now();
        self.check_rate_limits(day_start, now).await?;

        let url = self.request_url(&station.code, day_start, day_end)?;
        let headers = self.headers()?;
        let record_id = self.ledger.begin_request(url.as_str(), now).await?;
        tracing::info!(
            "ogimet: fetching {} for {}",
            station.code,
            day_start.date_naive()
        );

        let response = match self.client.get(url).headers(headers).send().await {
            Ok(response) => response,
            Err(e) => {
                self.ledger.finish_request(record_id, None, false).await?;
                return Err(FetchError::Upstream(format!("ogimet request failed: {}", e)));
            }
        };
        let status = response.status();
        let status_code = Some(i32::from(status.as_u16()));
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                self.ledger.finish_request(record_id, status_code, false).await?;
                return Err(FetchError::Upstream(format!(
                    "ogimet response body error: {}",
                    e
                )));
            }
        };

        if status == StatusCode::TOO_MANY_REQUESTS || body.contains(&self.config.quota_marker) {
            self.ledger.finish_request(record_id, status_code, true).await?;
            let retry_after = self.retry_delay();
            tracing::warn!(
                "ogimet: quota exhausted fetching {}, retry in {}s",
                station.code,
                retry_after.as_secs()
            );
            return Err(FetchError::RateLimited { retry_after });
        }
        self.ledger.finish_request(record_id, status_code, false).await?;

        if !status.is_success() {
            return Err(FetchError::Upstream(format!("ogimet returned HTTP {}", status)));
        }

        let reports = metar::split_reports(&body);
        if reports.is_empty() && body.contains(&self.config.error_marker) {
            return Err(FetchError::Upstream(format!(
                "ogimet reported an internal error for {}",
                station.code
            )));
        }

        let report_count = reports.len();
        let stored = self.store_reports(station, reports).await?;
        self.ledger
            .record_window(station.id, day_start, day_end, now)
            .await?;

        tracing::info!(
            "ogimet: {} reports for {} on {} ({} stored)",
            report_count,
            station.code,
            day_start.date_naive(),
            stored.len()
        );
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::helpers::day_bounds;
    use chrono::{Duration, NaiveDate};
    use tokio_test::{assert_err, assert_ok};
    use uuid::Uuid;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const LISTING: &str = "\
# METAR/SPECI de KDCA
200501011452 METAR KDCA 011452Z 32008KT 10SM FEW250 01/M06 A3033=
200501011552 METAR KDCA 011552Z 33010KT 10SM FEW250 02/M06 A3032=
";

    fn config(base_url: String) -> OgimetConfig {
        OgimetConfig {
            base_url,
            user_agent: "ride-weather-tests".to_string(),
            timeout: StdDuration::from_secs(5),
            quota_marker: "quota limit".to_string(),
            error_marker: "Internal error".to_string(),
        }
    }

    fn client(server: &MockServer, store: &Arc<MemoryStore>, limits: RateLimitConfig) -> OgimetClient {
        OgimetClient::new(
            config(format!("{}/display_metars2.php", server.uri())),
            limits,
            store.clone(),
            store.clone(),
            store.clone(),
        )
        .unwrap()
    }

    fn station(store: &MemoryStore) -> Station {
        let id = store.add_station("KDCA", 38.85, -77.04, 16.0);
        Station {
            id,
            code: "KDCA".to_string(),
            latitude: 38.85,
            longitude: -77.04,
            elevation_m: Some(16.0),
        }
    }

    fn old_day() -> (DateTime<Utc>, DateTime<Utc>) {
        day_bounds(NaiveDate::from_ymd_opt(2005, 1, 1).unwrap())
    }

    fn no_spacing() -> RateLimitConfig {
        RateLimitConfig {
            min_spacing: Duration::zero(),
            ..RateLimitConfig::default()
        }
    }

    #[tokio::test]
    async fn test_fetch_day_stores_reports_and_window() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/display_metars2.php"))
            .and(query_param("lugar", "KDCA"))
            .and(query_param("ano", "2005"))
            .and(query_param("dayf", "1"))
            .and(query_param("horaf", "23"))
            .and(query_param("minf", "59"))
            .respond_with(ResponseTemplate::new(200).set_body_string(LISTING))
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        let kdca = station(&store);
        let (start, end) = old_day();

        let observations = client(&server, &store, no_spacing())
            .fetch_day(&kdca, start, end)
            .await
            .unwrap();

        assert_eq!(observations.len(), 2);
        assert!(observations.iter().all(|o| o.station_id == kdca.id));
        assert_eq!(store.windows().len(), 1);
        let requests = store.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].status_code, Some(200));
        assert!(!requests[0].rate_limited);
        assert!(requests[0].url.contains("lugar=KDCA"));
    }

    #[tokio::test]
    async fn test_fetch_day_is_idempotent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/display_metars2.php"))
            .respond_with(ResponseTemplate::new(200).set_body_string(LISTING))
            .expect(2)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        let kdca = station(&store);
        let (start, end) = old_day();
        let ogimet = client(&server, &store, no_spacing());

        let first = ogimet.fetch_day(&kdca, start, end).await.unwrap();
        let count_after_first = store.observation_count();
        let second = ogimet.fetch_day(&kdca, start, end).await.unwrap();

        assert_eq!(store.observation_count(), count_after_first);
        let first_ids: Vec<Uuid> = first.iter().map(|o| o.id).collect();
        let second_ids: Vec<Uuid> = second.iter().map(|o| o.id).collect();
        assert_eq!(first_ids, second_ids);
    }

    #[tokio::test]
    async fn test_min_spacing_refuses_without_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(LISTING))
            .expect(0)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        let kdca = station(&store);
        store.push_request(Utc::now() - Duration::seconds(30), false);
        let (start, end) = old_day();
        let limits = RateLimitConfig {
            min_spacing: Duration::minutes(2),
            ..RateLimitConfig::default()
        };

        let err = client(&server, &store, limits)
            .fetch_day(&kdca, start, end)
            .await
            .unwrap_err();

        match err {
            FetchError::RateLimited { retry_after } => {
                assert!(retry_after >= StdDuration::from_secs(80));
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
        assert_eq!(store.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_recent_data_ignores_min_spacing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("# no reports\n"))
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        let kdca = station(&store);
        store.push_request(Utc::now() - Duration::seconds(30), false);
        let (start, end) = day_bounds((Utc::now() - Duration::days(2)).date_naive());

        let result = client(&server, &store, RateLimitConfig::default())
            .fetch_day(&kdca, start, end)
            .await;
        assert_ok!(result);
    }

    #[tokio::test]
    async fn test_recent_rate_limit_blocks() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(LISTING))
            .expect(0)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        let kdca = station(&store);
        store.push_request(Utc::now() - Duration::minutes(40), true);
        let (start, end) = old_day();

        let result = client(&server, &store, no_spacing())
            .fetch_day(&kdca, start, end)
            .await;
        assert!(matches!(result, Err(FetchError::RateLimited { .. })));
    }

    #[tokio::test]
    async fn test_request_ceiling_blocks() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(LISTING))
            .expect(0)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        let kdca = station(&store);
        for i in 0..3 {
            store.push_request(Utc::now() - Duration::minutes(10 + i), false);
        }
        let (start, end) = old_day();
        let limits = RateLimitConfig {
            max_requests: 3,
            ..no_spacing()
        };

        let result = client(&server, &store, limits)
            .fetch_day(&kdca, start, end)
            .await;
        assert!(matches!(result, Err(FetchError::RateLimited { .. })));
    }

    #[tokio::test]
    async fn test_quota_marker_marks_ledger() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "#Sorry, Your quota limit for slow queries rate has been reached\n",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        let kdca = station(&store);
        let (start, end) = old_day();

        let result = client(&server, &store, no_spacing())
            .fetch_day(&kdca, start, end)
            .await;

        assert!(matches!(result, Err(FetchError::RateLimited { .. })));
        let requests = store.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].rate_limited);
        assert!(store.windows().is_empty());
    }

    #[tokio::test]
    async fn test_internal_error_marker_is_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Internal error\n"))
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        let kdca = station(&store);
        let (start, end) = old_day();

        let result = client(&server, &store, no_spacing())
            .fetch_day(&kdca, start, end)
            .await;
        assert!(matches!(result, Err(FetchError::Upstream(_))));
        assert!(store.windows().is_empty());
    }

    #[tokio::test]
    async fn test_http_error_is_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        let kdca = station(&store);
        let (start, end) = old_day();

        let result = client(&server, &store, no_spacing())
            .fetch_day(&kdca, start, end)
            .await;
        assert!(matches!(result, Err(FetchError::Upstream(_))));
        assert_eq!(store.requests()[0].status_code, Some(502));
    }

    #[tokio::test]
    async fn test_unknown_station_code_gets_placeholder() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "200501011452 METAR KXYZ 011452Z 32008KT 10SM FEW250 01/M06 A3033=\n",
            ))
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        let kdca = station(&store);
        let (start, end) = old_day();

        let observations = client(&server, &store, no_spacing())
            .fetch_day(&kdca, start, end)
            .await
            .unwrap();

        assert_eq!(observations.len(), 1);
        assert_ne!(observations[0].station_id, kdca.id);
        assert!(store.station_codes().contains(&"KXYZ".to_string()));
    }

    #[tokio::test]
    async fn test_multi_day_window_rejected() {
        let server = MockServer::start().await;
        let store = Arc::new(MemoryStore::new());
        let kdca = station(&store);
        let (start, _) = old_day();

        let result = client(&server, &store, no_spacing())
            .fetch_day(&kdca, start, start + Duration::days(1))
            .await;
        assert_err!(&result);
        assert!(matches!(result, Err(FetchError::InvalidWindow(_))));
        assert!(store.requests().is_empty());
    }

    #[test]
    fn test_jittered_delay_positive() {
        for _ in 0..100 {
            let delay = jittered_delay(StdDuration::from_secs(300), 0.5);
            assert!(delay > StdDuration::ZERO);
        }
    }

    #[test]
    fn test_jittered_delay_invalid_sigma_falls_back_to_base() {
        for sigma in [-1.0, f64::NAN, f64::INFINITY] {
            let delay = jittered_delay(StdDuration::from_secs(300), sigma);
            assert_eq!(delay, StdDuration::from_secs(300));
        }
    }

    #[test]
    fn test_jittered_delay_large_sigma_is_bounded() {
        for _ in 0..100 {
            let delay = jittered_delay(StdDuration::from_secs(300), 500.0);
            assert!(delay <= StdDuration::from_secs(300 * 20));
        }
    }

    #[test]
    fn test_jittered_delay_huge_base_does_not_panic() {
        let delay = jittered_delay(StdDuration::from_secs(u64::MAX), 0.5);
        assert!(delay > StdDuration::ZERO);
    }
}
