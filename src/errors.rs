use std::time::Duration;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

/// Standard error response body.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Human-readable error message
    pub error: String,
}

/// Failures of the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised while acquiring reports from the upstream weather source.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The request was refused locally, or the upstream reported quota
    /// exhaustion. Retry after roughly `retry_after`.
    #[error("Upstream rate limit in effect, retry in {}s", retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Invalid fetch window: {0}")]
    InvalidWindow(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl FetchError {
    /// Suggested delay before the same fetch is attempted again, if the
    /// failure is worth retrying at all.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::RateLimited { retry_after } => Some(*retry_after),
            FetchError::Upstream(_) => Some(Duration::ZERO),
            FetchError::InvalidWindow(_) | FetchError::Store(_) => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retry_after().is_some()
    }
}

/// Structural errors of the interval averager.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AverageError {
    #[error("No observations supplied")]
    NoObservations,

    #[error("Interval end must be after its start")]
    EmptyInterval,
}

/// Errors of a single ride weather update.
#[derive(Debug, thiserror::Error)]
pub enum WeatherError {
    #[error("Ride {0} not found")]
    RideNotFound(Uuid),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Average(#[from] AverageError),
}

impl WeatherError {
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            WeatherError::Fetch(err) => err.retry_after(),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retry_after().is_some()
    }
}

/// Missing or malformed configuration values.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{key} has invalid value '{value}'")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Service unavailable: {message}")]
    Unavailable {
        message: String,
        retry_after: Duration,
    },

    #[error("External service error: {0}")]
    ExternalServiceError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Unavailable {
                message,
                retry_after,
            } => {
                let body = axum::Json(ErrorResponse {
                    error: message.clone(),
                });
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    [(header::RETRY_AFTER, retry_after.as_secs().to_string())],
                    body,
                )
                    .into_response();
            }
            AppError::ExternalServiceError(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            AppError::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            AppError::DatabaseError(err) => {
                tracing::error!("Database error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal database error".to_string(),
                )
            }
        };

        (status, axum::Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Database(e) => AppError::DatabaseError(e),
            StoreError::Serialization(e) => {
                AppError::InternalError(format!("Serialization error: {}", e))
            }
        }
    }
}

impl From<WeatherError> for AppError {
    fn from(err: WeatherError) -> Self {
        if let Some(retry_after) = err.retry_after() {
            return AppError::Unavailable {
                message: err.to_string(),
                retry_after,
            };
        }
        match err {
            WeatherError::RideNotFound(id) => AppError::NotFound(format!("Ride {} not found", id)),
            WeatherError::Store(e) => e.into(),
            WeatherError::Fetch(e) => AppError::ExternalServiceError(e.to_string()),
            WeatherError::Average(e) => AppError::InternalError(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_is_retryable_with_delay() {
        let err = FetchError::RateLimited {
            retry_after: Duration::from_secs(240),
        };
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(240)));
        assert!(err.to_string().contains("240s"));
    }

    #[test]
    fn test_invalid_window_not_retryable() {
        let err = FetchError::InvalidWindow("spans two days".to_string());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_weather_error_delegates_retry() {
        let err: WeatherError = FetchError::Upstream("Internal error".to_string()).into();
        assert!(err.is_retryable());

        let err: WeatherError = AverageError::NoObservations.into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_retryable_maps_to_unavailable() {
        let err: WeatherError = FetchError::RateLimited {
            retry_after: Duration::from_secs(90),
        }
        .into();
        let response = AppError::from(err).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            "90"
        );
    }

    #[test]
    fn test_missing_ride_maps_to_not_found() {
        let response = AppError::from(WeatherError::RideNotFound(Uuid::nil())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
