//! Ride weather jobs.
//!
//! A single-ride job retries retryable failures (mostly upstream rate
//! limiting) with exponential backoff. The batch job fills every ride that
//! has no weather yet: one job per ride, started with staggered jittered
//! delays so the upstream sees a trickle rather than a burst, and a single
//! retraining request once the whole batch has finished.
//!
//! Counters live in-memory (`Arc<RwLock<JobState>>`) and are exposed via the
//! status endpoint; they reset on restart.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use rand::Rng;
use serde::Serialize;
use tokio::sync::RwLock;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::JobConfig;
use crate::errors::{StoreError, WeatherError};
use crate::services::ride_weather::{RideWeatherService, UpdateOutcome};

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: StdDuration,
    pub max_delay: StdDuration,
}

impl From<&JobConfig> for RetryPolicy {
    fn from(config: &JobConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.backoff_base,
            max_delay: config.backoff_max,
        }
    }
}

impl RetryPolicy {
    /// Upper bound of the backoff after failed attempt `attempt` (1-based).
    pub fn backoff_ceiling(&self, attempt: u32) -> StdDuration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1 << exponent)
            .min(self.max_delay)
    }

    /// Wait before the next attempt: jittered backoff, but never less than
    /// the delay the failure itself suggested.
    pub fn delay_for(&self, attempt: u32, suggested: Option<StdDuration>) -> StdDuration {
        let factor = rand::thread_rng().gen_range(0.5..=1.0);
        let backoff = self.backoff_ceiling(attempt).mul_f64(factor);
        backoff.max(suggested.unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Job state (in-memory, shared via Arc<RwLock<>>)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct JobState {
    pub queued: u64,
    pub running: u64,
    pub succeeded: u64,
    /// Rides left alone: incomplete data or no covering station.
    pub skipped: u64,
    pub failed: u64,
    /// Attempts that were retried after a retryable error.
    pub retried: u64,
    pub last_error: Option<String>,
    pub last_batch_started_at: Option<DateTime<Utc>>,
    pub last_batch_completed_at: Option<DateTime<Utc>>,
    pub last_batch_size: usize,
}

/// Shared job state handle.
pub type SharedJobState = Arc<RwLock<JobState>>;

/// Totals of one fill-missing batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Start delays for a batch: `i * spacing` plus up to one more `spacing`.
pub fn fan_out_delays(count: usize, spacing: StdDuration) -> Vec<StdDuration> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|i| spacing.mul_f64(i as f64 + rng.gen::<f64>()))
        .collect()
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// Count a job as queued before it is started.
pub async fn enqueue(state: &SharedJobState, count: usize) {
    state.write().await.queued += count as u64;
}

/// Update one ride with retries and retrain on success.
///
/// The caller must have [`enqueue`]d the job.
pub async fn run_update_job(
    service: &RideWeatherService,
    ride_id: Uuid,
    policy: &RetryPolicy,
    state: &SharedJobState,
) -> Result<UpdateOutcome, WeatherError> {
    let outcome = run_with_retry(service, ride_id, policy, state).await?;
    if matches!(outcome, UpdateOutcome::Updated(_)) {
        service.trigger_retrain();
    }
    Ok(outcome)
}

async fn run_with_retry(
    service: &RideWeatherService,
    ride_id: Uuid,
    policy: &RetryPolicy,
    state: &SharedJobState,
) -> Result<UpdateOutcome, WeatherError> {
    {
        let mut s = state.write().await;
        s.queued = s.queued.saturating_sub(1);
        s.running += 1;
    }

    let mut attempt = 1;
    let result = loop {
        match service.refresh(ride_id).await {
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt, e.retry_after());
                tracing::warn!(
                    "Ride {}: attempt {}/{} failed ({}), retrying in {}s",
                    ride_id,
                    attempt,
                    policy.max_attempts,
                    e,
                    delay.as_secs()
                );
                state.write().await.retried += 1;
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => break other,
        }
    };

    let mut s = state.write().await;
    s.running = s.running.saturating_sub(1);
    match &result {
        Ok(UpdateOutcome::Updated(_)) => s.succeeded += 1,
        Ok(_) => s.skipped += 1,
        Err(e) => {
            tracing::error!("Ride {}: weather update failed: {}", ride_id, e);
            s.failed += 1;
            s.last_error = Some(format!("ride {}: {}", ride_id, e));
        }
    }
    result
}

/// Update every ride without weather, then retrain once.
pub async fn fill_missing_weather(
    service: &RideWeatherService,
    policy: &RetryPolicy,
    spacing: StdDuration,
    state: &SharedJobState,
) -> Result<BatchSummary, StoreError> {
    let ride_ids = service.rides_missing_weather().await?;
    {
        let mut s = state.write().await;
        s.last_batch_started_at = Some(Utc::now());
        s.last_batch_size = ride_ids.len();
        s.queued += ride_ids.len() as u64;
    }
    tracing::info!("Filling weather for {} rides", ride_ids.len());

    let delays = fan_out_delays(ride_ids.len(), spacing);
    let jobs = ride_ids.iter().zip(delays).map(|(&ride_id, delay)| async move {
        tokio::time::sleep(delay).await;
        run_with_retry(service, ride_id, policy, state).await
    });
    let results = join_all(jobs).await;

    let mut summary = BatchSummary::default();
    for result in &results {
        match result {
            Ok(UpdateOutcome::Updated(_)) => summary.updated += 1,
            Ok(_) => summary.skipped += 1,
            Err(_) => summary.failed += 1,
        }
    }
    if summary.updated > 0 {
        service.trigger_retrain();
    }

    state.write().await.last_batch_completed_at = Some(Utc::now());
    tracing::info!(
        "Batch complete: {} updated, {} skipped, {} failed",
        summary.updated,
        summary.skipped,
        summary.failed
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FetchWindowPolicy;
    use crate::db::memory::MemoryStore;
    use crate::db::store::RideRepository;
    use crate::errors::FetchError;
    use crate::services::observation_cache::tests::{report, ScriptedFetcher};
    use crate::services::observation_cache::StationObservationCache;
    use crate::services::ride_weather::{FixedTimezoneResolver, RetrainTrigger};
    use crate::services::stations::StationSelector;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingRetrain(AtomicUsize);

    #[async_trait]
    impl RetrainTrigger for CountingRetrain {
        async fn retrain(&self) -> Result<(), reqwest::Error> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: StdDuration::from_millis(1),
            max_delay: StdDuration::from_millis(5),
        }
    }

    fn setup() -> (
        Arc<MemoryStore>,
        Arc<ScriptedFetcher>,
        Arc<CountingRetrain>,
        RideWeatherService,
    ) {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(ScriptedFetcher::with_store(store.clone()));
        let retrain = Arc::new(CountingRetrain::default());
        store.add_station("KDCA", 38.85, -77.04, 16.0);
        fetcher.serve(
            "KDCA",
            vec![
                report("2005-01-01T14:52:00Z", 1.0),
                report("2005-01-01T15:52:00Z", 2.0),
            ],
        );
        let cache = StationObservationCache::new(
            store.clone(),
            store.clone(),
            fetcher.clone(),
            FetchWindowPolicy::default(),
        );
        let service = RideWeatherService::new(
            store.clone(),
            StationSelector::new(store.clone(), cache, 5),
            Arc::new(FixedTimezoneResolver(chrono_tz::UTC)),
            retrain.clone(),
        );
        (store, fetcher, retrain, service)
    }

    fn complete_ride(store: &MemoryStore) -> Uuid {
        let home = store.add_location("Home", Some(38.9), Some(-77.0), Some(10.0), None);
        let day = NaiveDate::from_ymd_opt(2005, 1, 1).unwrap();
        store.add_ride(
            day.and_hms_opt(15, 0, 0),
            day.and_hms_opt(15, 15, 0),
            Some(home),
            Some(home),
        )
    }

    fn rate_limited() -> FetchError {
        FetchError::RateLimited {
            retry_after: StdDuration::from_millis(2),
        }
    }

    fn new_state() -> SharedJobState {
        Arc::new(RwLock::new(JobState::default()))
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: StdDuration::from_secs(60),
            max_delay: StdDuration::from_secs(300),
        };
        assert_eq!(policy.backoff_ceiling(1), StdDuration::from_secs(60));
        assert_eq!(policy.backoff_ceiling(2), StdDuration::from_secs(120));
        assert_eq!(policy.backoff_ceiling(3), StdDuration::from_secs(240));
        assert_eq!(policy.backoff_ceiling(4), StdDuration::from_secs(300));
        assert_eq!(policy.backoff_ceiling(40), StdDuration::from_secs(300));
    }

    #[test]
    fn test_delay_respects_suggested_delay() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: StdDuration::from_secs(60),
            max_delay: StdDuration::from_secs(300),
        };
        for _ in 0..20 {
            let delay = policy.delay_for(1, None);
            assert!(delay >= StdDuration::from_secs(30) && delay <= StdDuration::from_secs(60));
            let delay = policy.delay_for(1, Some(StdDuration::from_secs(900)));
            assert_eq!(delay, StdDuration::from_secs(900));
        }
    }

    #[test]
    fn test_fan_out_delays_are_staggered() {
        let spacing = StdDuration::from_secs(20);
        let delays = fan_out_delays(5, spacing);
        assert_eq!(delays.len(), 5);
        for (i, delay) in delays.iter().enumerate() {
            assert!(*delay >= spacing * i as u32);
            assert!(*delay <= spacing * (i as u32 + 1));
        }
    }

    #[tokio::test]
    async fn test_retries_after_rate_limit() {
        let (store, fetcher, retrain, service) = setup();
        let ride = complete_ride(&store);
        fetcher.fail_next(rate_limited());
        let state = new_state();
        enqueue(&state, 1).await;

        let outcome = run_update_job(&service, ride, &fast_policy(3), &state)
            .await
            .unwrap();

        assert!(matches!(outcome, UpdateOutcome::Updated(_)));
        assert_eq!(fetcher.called_codes().len(), 2);
        let s = state.read().await;
        assert_eq!((s.queued, s.running), (0, 0));
        assert_eq!((s.succeeded, s.retried, s.failed), (1, 1, 0));

        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert_eq!(retrain.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let (store, fetcher, retrain, service) = setup();
        let ride = complete_ride(&store);
        fetcher.fail_next(rate_limited());
        fetcher.fail_next(rate_limited());
        let state = new_state();
        enqueue(&state, 1).await;

        let result = run_update_job(&service, ride, &fast_policy(2), &state).await;

        assert!(matches!(
            result,
            Err(WeatherError::Fetch(FetchError::RateLimited { .. }))
        ));
        let s = state.read().await;
        assert_eq!((s.retried, s.failed), (1, 1));
        assert!(s.last_error.is_some());
        assert_eq!(retrain.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_immediately() {
        let (_store, fetcher, _retrain, service) = setup();
        let state = new_state();
        enqueue(&state, 1).await;

        let result = run_update_job(&service, Uuid::new_v4(), &fast_policy(5), &state).await;

        assert!(matches!(result, Err(WeatherError::RideNotFound(_))));
        assert!(fetcher.called_codes().is_empty());
        assert_eq!(state.read().await.retried, 0);
    }

    #[tokio::test]
    async fn test_fill_missing_retrains_once() {
        let (store, _fetcher, retrain, service) = setup();
        let first = complete_ride(&store);
        let second = complete_ride(&store);
        store.add_ride(None, None, None, None);
        let state = new_state();

        let summary = fill_missing_weather(
            &service,
            &fast_policy(3),
            StdDuration::from_millis(1),
            &state,
        )
        .await
        .unwrap();

        assert_eq!(
            summary,
            BatchSummary {
                updated: 2,
                skipped: 1,
                failed: 0
            }
        );
        assert!(store.ride_weather(first).await.unwrap().is_some());
        assert!(store.ride_weather(second).await.unwrap().is_some());
        let s = state.read().await;
        assert_eq!(s.last_batch_size, 3);
        assert!(s.last_batch_completed_at.is_some());
        assert_eq!(s.queued, 0);

        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert_eq!(retrain.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fill_missing_without_updates_does_not_retrain() {
        let (store, _fetcher, retrain, service) = setup();
        store.add_ride(None, None, None, None);
        let state = new_state();

        let summary = fill_missing_weather(&service, &fast_policy(1), StdDuration::ZERO, &state)
            .await
            .unwrap();

        assert_eq!(summary.skipped, 1);
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        assert_eq!(retrain.0.load(Ordering::SeqCst), 0);
    }
}
