//! Application configuration, parsed from environment variables.
//!
//! Every threshold of the acquisition pipeline is tunable here; the defaults
//! match what the upstream tolerates in practice.

use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::Duration;
use chrono_tz::Tz;

use crate::errors::ConfigError;

/// Default upstream endpoint serving plain-text METAR listings.
pub const DEFAULT_OGIMET_BASE_URL: &str = "https://www.ogimet.com/display_metars2.php";

/// Largest accepted log-normal sigma for retry delays.
pub const MAX_RETRY_SIGMA: f64 = 3.0;

/// Longest accepted duration setting.
pub const MAX_CONFIG_SPAN_DAYS: i64 = 36_500;

/// Top-level application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub port: u16,
    /// `pretty` or `json`.
    pub log_format: String,
    pub ogimet: OgimetConfig,
    pub rate_limit: RateLimitConfig,
    pub windows: FetchWindowPolicy,
    pub jobs: JobConfig,
    /// Number of candidate stations the selector walks, nearest first.
    pub station_max_results: usize,
    /// Zone used, without caching it, for coordinates that resolve to no
    /// zone.
    pub default_timezone: Option<Tz>,
    /// Endpoint notified after ride weather changed. Disabled when unset.
    pub retrain_url: Option<String>,
}

/// Upstream client settings.
#[derive(Debug, Clone)]
pub struct OgimetConfig {
    pub base_url: String,
    pub user_agent: String,
    pub timeout: StdDuration,
    /// Body substring signalling that the query quota is exhausted.
    pub quota_marker: String,
    /// Body substring signalling an upstream internal error.
    pub error_marker: String,
}

/// Client-side throttling applied before every upstream request.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// A rate-limited request younger than this blocks new requests.
    pub cooldown: Duration,
    /// Rolling window for the request ceiling.
    pub window: Duration,
    /// Requests allowed within `window`.
    pub max_requests: i64,
    /// Minimum gap between consecutive requests for slow queries.
    pub min_spacing: Duration,
    /// Queries for data older than this count as slow.
    pub slow_query_age: Duration,
    /// Median of the suggested retry delay.
    pub retry_base: StdDuration,
    /// Log-normal sigma applied to `retry_base`.
    pub retry_sigma: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::hours(1),
            window: Duration::hours(2),
            max_requests: 55,
            min_spacing: Duration::minutes(2),
            slow_query_age: Duration::days(84),
            retry_base: StdDuration::from_secs(300),
            retry_sigma: 0.5,
        }
    }
}

/// When a previously fetched day of reports should be fetched again.
#[derive(Debug, Clone)]
pub struct FetchWindowPolicy {
    /// Padding added on both sides of a ride interval.
    pub expansion: Duration,
    /// Never re-fetch a window fetched more recently than this.
    pub recent_grace: Duration,
    /// A fetch made less than this after the window ended may have missed
    /// reports that were not yet published.
    pub settle: Duration,
    /// Fetches older than this are refreshed.
    pub max_age: Duration,
}

impl Default for FetchWindowPolicy {
    fn default() -> Self {
        Self {
            expansion: Duration::hours(2),
            recent_grace: Duration::minutes(15),
            settle: Duration::hours(3),
            max_age: Duration::days(90),
        }
    }
}

/// Retry and fan-out behaviour of background jobs.
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub max_attempts: u32,
    pub backoff_base: StdDuration,
    pub backoff_max: StdDuration,
    /// Start delay added per fan-out index in batch jobs.
    pub fan_out_spacing: StdDuration,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: StdDuration::from_secs(60),
            backoff_max: StdDuration::from_secs(3600),
            fan_out_spacing: StdDuration::from_secs(20),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let default_timezone = lookup("DEFAULT_TIMEZONE")
            .map(|name| {
                name.parse::<Tz>().map_err(|_| ConfigError::Invalid {
                    key: "DEFAULT_TIMEZONE",
                    value: name,
                })
            })
            .transpose()?;

        let ogimet = OgimetConfig {
            base_url: lookup("OGIMET_BASE_URL")
                .unwrap_or_else(|| DEFAULT_OGIMET_BASE_URL.to_string()),
            user_agent: lookup("OGIMET_USER_AGENT")
                .unwrap_or_else(|| format!("ride-weather/{}", env!("CARGO_PKG_VERSION"))),
            timeout: StdDuration::from_secs(parse_or(&lookup, "OGIMET_TIMEOUT_SECS", 30)?),
            quota_marker: lookup("OGIMET_QUOTA_MARKER").unwrap_or_else(|| "quota limit".to_string()),
            error_marker: lookup("OGIMET_ERROR_MARKER")
                .unwrap_or_else(|| "Internal error".to_string()),
        };

        let rl = RateLimitConfig::default();
        let rate_limit = RateLimitConfig {
            cooldown: seconds_or(&lookup, "RATE_LIMIT_COOLDOWN_SECS", rl.cooldown)?,
            window: seconds_or(&lookup, "RATE_LIMIT_WINDOW_SECS", rl.window)?,
            max_requests: parse_or(&lookup, "RATE_LIMIT_MAX_REQUESTS", rl.max_requests)?,
            min_spacing: seconds_or(&lookup, "RATE_LIMIT_MIN_SPACING_SECS", rl.min_spacing)?,
            slow_query_age: days_or(&lookup, "RATE_LIMIT_SLOW_QUERY_DAYS", rl.slow_query_age)?,
            retry_base: StdDuration::from_secs(parse_or(
                &lookup,
                "RATE_LIMIT_RETRY_BASE_SECS",
                rl.retry_base.as_secs(),
            )?),
            retry_sigma: retry_sigma(&lookup, rl.retry_sigma)?,
        };

        let wp = FetchWindowPolicy::default();
        let windows = FetchWindowPolicy {
            expansion: seconds_or(&lookup, "FETCH_WINDOW_EXPANSION_SECS", wp.expansion)?,
            recent_grace: seconds_or(&lookup, "FETCH_RECENT_GRACE_SECS", wp.recent_grace)?,
            settle: seconds_or(&lookup, "FETCH_SETTLE_SECS", wp.settle)?,
            max_age: days_or(&lookup, "FETCH_MAX_AGE_DAYS", wp.max_age)?,
        };

        let jc = JobConfig::default();
        let jobs = JobConfig {
            max_attempts: parse_or(&lookup, "JOB_MAX_ATTEMPTS", jc.max_attempts)?,
            backoff_base: StdDuration::from_secs(parse_or(
                &lookup,
                "JOB_BACKOFF_BASE_SECS",
                jc.backoff_base.as_secs(),
            )?),
            backoff_max: StdDuration::from_secs(parse_or(
                &lookup,
                "JOB_BACKOFF_MAX_SECS",
                jc.backoff_max.as_secs(),
            )?),
            fan_out_spacing: StdDuration::from_secs(parse_or(
                &lookup,
                "JOB_FAN_OUT_SPACING_SECS",
                jc.fan_out_spacing.as_secs(),
            )?),
        };

        Ok(Self {
            database_url,
            port: parse_or(&lookup, "PORT", 8080)?,
            log_format: lookup("LOG_FORMAT").unwrap_or_else(|| "pretty".to_string()),
            ogimet,
            rate_limit,
            windows,
            jobs,
            station_max_results: parse_or(&lookup, "STATION_MAX_RESULTS", 10)?,
            default_timezone,
            retrain_url: lookup("RETRAIN_URL").filter(|url| !url.trim().is_empty()),
        })
    }
}

/// Whole seconds under `key`, or `default`.
fn seconds_or<F>(lookup: &F, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let secs = parse_or(lookup, key, default.num_seconds())?;
    within_span(key, secs, Duration::try_seconds(secs))
}

/// Whole days under `key`, or `default`.
fn days_or<F>(lookup: &F, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let days = parse_or(lookup, key, default.num_days())?;
    within_span(key, days, Duration::try_days(days))
}

fn within_span(
    key: &'static str,
    raw: i64,
    duration: Option<Duration>,
) -> Result<Duration, ConfigError> {
    duration
        .filter(|d| *d >= Duration::zero() && *d <= Duration::days(MAX_CONFIG_SPAN_DAYS))
        .ok_or(ConfigError::Invalid {
            key,
            value: raw.to_string(),
        })
}

/// Log-normal sigma of the retry delay, within `0..=MAX_RETRY_SIGMA`.
fn retry_sigma<F>(lookup: &F, default: f64) -> Result<f64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    const KEY: &str = "RATE_LIMIT_RETRY_SIGMA";
    let sigma: f64 = parse_or(lookup, KEY, default)?;
    if sigma.is_finite() && (0.0..=MAX_RETRY_SIGMA).contains(&sigma) {
        Ok(sigma)
    } else {
        Err(ConfigError::Invalid {
            key: KEY,
            value: sigma.to_string(),
        })
    }
}

/// Parse `key` when present, otherwise fall back to `default`.
fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
        None => Ok(default),
    }
}
