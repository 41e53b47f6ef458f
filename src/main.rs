mod app_state;
mod config;
mod models;
mod routes;
mod services;

use std::sync::Arc;
use std::time::Duration;

use axum::{routing::delete, routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::RwLock;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use app_state::AppState;
use config::AppConfig;
use models::state::JobState;
use services::download::Downloader;
use services::driver::HttpPageDriver;
use services::runner::Runner;
use services::state_store::StateStore;
use services::store::{BlobStore, ImageStore};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing imagine-batch");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    // Register application metrics
    metrics::describe_counter!("batch_items_completed", "Items that finished successfully");
    metrics::describe_counter!("batch_items_failed", "Items that failed");
    metrics::describe_gauge!("batch_queue_depth", "Items still ahead of the cursor");
    metrics::describe_histogram!("batch_item_seconds", "Wall time per processed item");

    // Initialize the image store
    tracing::info!("Initializing image store");
    let store: Arc<dyn BlobStore> = Arc::new(
        ImageStore::new(
            &config.store_bucket,
            &config.store_endpoint,
            &config.store_access_key,
            &config.store_secret_key,
        )
        .expect("Failed to initialize image store"),
    );

    // Initialize Redis state persistence
    tracing::info!("Connecting to Redis state store");
    let state_store =
        Arc::new(StateStore::new(&config.redis_url).expect("Failed to initialize state store"));

    // Restore persisted job state so a restart resumes with the previous
    // queue; a run that was in flight is not resumed automatically.
    let jobs = match state_store.load().await {
        Ok(Some(saved)) => {
            let restored = JobState::restore(saved);
            tracing::info!(items = restored.items.len(), "job state restored from Redis");
            restored
        }
        Ok(None) => JobState::default(),
        Err(e) => {
            tracing::warn!(error = %e, "failed to load persisted state, starting fresh");
            JobState::default()
        }
    };
    let jobs = Arc::new(RwLock::new(jobs));

    // Page driver against the target site
    tracing::info!(url = %config.target_url, "Initializing page driver");
    let driver = HttpPageDriver::new(
        &config.target_url,
        Duration::from_secs(config.generation_timeout_secs),
    )
    .expect("Failed to initialize page driver");

    // Spawn the queue runner
    let runner = Runner::spawn(
        Arc::clone(&jobs),
        Arc::clone(&store),
        Arc::clone(&state_store),
        Box::new(driver),
        Downloader::new(&config.download_dir),
        Duration::from_secs(config.watchdog_secs),
    );

    // Create shared application state
    let state = AppState::new(store, state_store, jobs, runner);

    // Build API routes
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/api/v1/state", get(routes::images::get_state))
        .route(
            "/api/v1/images",
            post(routes::images::add_images).delete(routes::images::clear_images),
        )
        .route("/api/v1/images/{id}", delete(routes::images::remove_image))
        .route("/api/v1/run/start", post(routes::control::start_run))
        .route("/api/v1/run/pause", post(routes::control::toggle_pause))
        .route("/api/v1/run/cancel", post(routes::control::cancel_run))
        .route("/api/v1/report", get(routes::control::report))
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(25 * 1024 * 1024)); // 25 MB limit

    tracing::info!("Starting imagine-batch on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app).await.expect("Server error");
}
