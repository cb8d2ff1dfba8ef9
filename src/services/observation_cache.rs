//! Stored-first access to station reports.
//!
//! Reports are served from the observation store whenever it already spans
//! the requested interval. Otherwise the whole UTC days around the interval
//! are checked against the fetch window log and only stale days are fetched
//! again.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::FetchWindowPolicy;
use crate::db::models::{Station, WeatherObservation};
use crate::db::store::{FetchLedger, ObservationStore};
use crate::errors::FetchError;
use crate::helpers::utc_days;
use crate::services::ogimet::ReportFetcher;

/// Outcome of the window policy for one station-day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefetchDecision {
    /// Never fetched, or the previous fetch is stale.
    Fetch,
    /// Fetched moments ago; asking again would only burn quota.
    SkipRecent,
    /// The previous fetch is still good.
    SkipFresh,
}

impl FetchWindowPolicy {
    pub fn decide(
        &self,
        last_fetched_at: Option<DateTime<Utc>>,
        window_end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RefetchDecision {
        let Some(fetched_at) = last_fetched_at else {
            return RefetchDecision::Fetch;
        };
        if now - fetched_at < self.recent_grace {
            return RefetchDecision::SkipRecent;
        }
        if fetched_at < window_end + self.settle || now - fetched_at > self.max_age {
            return RefetchDecision::Fetch;
        }
        RefetchDecision::SkipFresh
    }
}

/// True when `observations` (ascending) cover `[start, end]`.
pub fn spans_interval(
    observations: &[WeatherObservation],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> bool {
    match (observations.first(), observations.last()) {
        (Some(first), Some(last)) => first.report_time <= start && last.report_time >= end,
        _ => false,
    }
}

/// Serves a station's reports for an interval, fetching missing days.
#[derive(Clone)]
pub struct StationObservationCache {
    store: Arc<dyn ObservationStore>,
    ledger: Arc<dyn FetchLedger>,
    fetcher: Arc<dyn ReportFetcher>,
    policy: FetchWindowPolicy,
}

impl StationObservationCache {
    pub fn new(
        store: Arc<dyn ObservationStore>,
        ledger: Arc<dyn FetchLedger>,
        fetcher: Arc<dyn ReportFetcher>,
        policy: FetchWindowPolicy,
    ) -> Self {
        Self {
            store,
            ledger,
            fetcher,
            policy,
        }
    }

    /// Reports of `station` around `[start, end]`, padded by the configured
    /// expansion, ascending. Coverage is not guaranteed; callers check it.
    pub async fn observations_for(
        &self,
        station: &Station,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<WeatherObservation>, FetchError> {
        let padded_start = start - self.policy.expansion;
        let padded_end = end + self.policy.expansion;

        let stored = self
            .store
            .query_range(station.id, padded_start, padded_end)
            .await?;
        if spans_interval(&stored, start, end) {
            tracing::debug!("Cache: {} already covers {} to {}", station.code, start, end);
            return Ok(stored);
        }

        let now = Utc::now();
        let mut fetched = false;
        for (day_start, day_end) in utc_days(padded_start, padded_end) {
            if day_start > now {
                tracing::debug!(
                    "Cache: {} has no reports yet for {}",
                    station.code,
                    day_start.date_naive()
                );
                continue;
            }
            let last = self
                .ledger
                .latest_window(station.id, day_start, day_end)
                .await?
                .map(|w| w.fetched_at);
            match self.policy.decide(last, day_end, now) {
                RefetchDecision::Fetch => {
                    self.fetcher.fetch_day(station, day_start, day_end).await?;
                    fetched = true;
                }
                decision => {
                    tracing::debug!(
                        "Cache: not refetching {} for {} ({:?})",
                        station.code,
                        day_start.date_naive(),
                        decision
                    );
                }
            }
        }

        if !fetched {
            return Ok(stored);
        }
        Ok(self
            .store
            .query_range(station.id, padded_start, padded_end)
            .await?)
    }
}
