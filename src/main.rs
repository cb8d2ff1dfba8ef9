// Ride Weather API v0.1
use axum::{
    routing::{get, post},
    Router,
};
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod config;
mod db;
mod errors;
mod helpers;
mod routes;
mod services;

use config::AppConfig;
use db::queries::PgStore;
use routes::AppState;
use services::jobs::{JobState, RetryPolicy, SharedJobState};
use services::observation_cache::StationObservationCache;
use services::ogimet::OgimetClient;
use services::ride_weather::{
    CoordinateTimezoneResolver, HttpRetrainTrigger, NoopRetrainTrigger, RetrainTrigger,
    RideWeatherService,
};
use services::stations::StationSelector;

/// Maximum number of connections in the database pool.
const DB_POOL_MAX_CONNECTIONS: u32 = 5;
/// Minimum number of connections kept alive in the database pool.
const DB_POOL_MIN_CONNECTIONS: u32 = 2;

/// Ride Weather API OpenAPI document.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Ride Weather API",
        version = "0.1.0",
        description = "Weather for logged bicycle rides. Fetches historical METAR reports \
            from ogimet for the nearest reporting station, stores them, and averages them \
            over each ride's time interval with an altitude correction to the ride's \
            elevation.",
        license(name = "MIT"),
    ),
    tags(
        (name = "Health", description = "Service health check"),
        (name = "Rides", description = "Per-ride weather"),
        (name = "Jobs", description = "Background weather jobs"),
        (name = "Upstream", description = "ogimet request ledger"),
    ),
    paths(
        routes::health::health_check,
        routes::rides::queue_ride_weather,
        routes::rides::get_ride_weather,
        routes::jobs::fill_missing_weather,
        routes::jobs::get_job_status,
        routes::requests::get_request_stats,
    ),
    components(
        schemas(
            routes::health::HealthResponse,
            routes::rides::JobAccepted,
            routes::jobs::BatchAccepted,
            routes::requests::RequestStatsResponse,
            db::models::AveragedWeather,
            db::models::FetchRecord,
            db::models::RequestStats,
            services::jobs::JobState,
            errors::ErrorResponse,
        )
    )
)]
struct ApiDoc;

fn init_tracing(log_format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "ride_weather=debug,tower_http=debug".into());
    let registry = tracing_subscriber::registry().with(filter);
    if log_format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() {
    let config = AppConfig::from_env().expect("Invalid configuration");
    init_tracing(&config.log_format);

    // Set up database connection pool
    let pool = PgPoolOptions::new()
        .max_connections(DB_POOL_MAX_CONNECTIONS)
        .min_connections(DB_POOL_MIN_CONNECTIONS)
        .connect(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Run migrations
    sqlx::migrate!()
        .run(&pool)
        .await
        .expect("Failed to run database migrations");

    tracing::info!("Database migrations completed");

    let store = Arc::new(PgStore::new(pool.clone()));

    let ogimet = OgimetClient::new(
        config.ogimet.clone(),
        config.rate_limit.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
    )
    .expect("Failed to build ogimet HTTP client");
    tracing::info!("Fetching METAR reports from {}", config.ogimet.base_url);

    let cache = StationObservationCache::new(
        store.clone(),
        store.clone(),
        Arc::new(ogimet),
        config.windows.clone(),
    );
    let selector = StationSelector::new(store.clone(), cache, config.station_max_results);

    let retrain: Arc<dyn RetrainTrigger> = match &config.retrain_url {
        Some(url) => {
            tracing::info!("Retraining hook: {}", url);
            Arc::new(HttpRetrainTrigger::new(url.clone()))
        }
        None => {
            tracing::warn!("RETRAIN_URL not set, retraining requests are dropped");
            Arc::new(NoopRetrainTrigger)
        }
    };

    let service = RideWeatherService::new(
        store.clone(),
        selector,
        Arc::new(CoordinateTimezoneResolver::new()),
        retrain,
    )
    .with_fallback_timezone(config.default_timezone);

    let job_state: SharedJobState = Arc::new(RwLock::new(JobState::default()));

    // Build shared application state
    let app_state = AppState {
        pool,
        ledger: store,
        service,
        jobs: job_state,
        retry: RetryPolicy::from(&config.jobs),
        fan_out_spacing: config.jobs.fan_out_spacing,
        cooldown: config.rate_limit.cooldown,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/api/v1/health", get(routes::health::health_check))
        .route(
            "/api/v1/rides/:id/weather",
            get(routes::rides::get_ride_weather).post(routes::rides::queue_ride_weather),
        )
        .route(
            "/api/v1/weather/fill-missing",
            post(routes::jobs::fill_missing_weather),
        )
        .route("/api/v1/jobs/status", get(routes::jobs::get_job_status))
        .route(
            "/api/v1/ogimet/requests",
            get(routes::requests::get_request_stats),
        )
        .with_state(app_state);

    let app = Router::new()
        .merge(api_routes)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("API server listening on {}", addr);
    tracing::info!(
        "Swagger UI available at http://localhost:{}/swagger-ui/",
        config.port
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind TCP listener");
    axum::serve(listener, app)
        .await
        .expect("Server terminated unexpectedly");
}
