use axum::extract::DefaultBodyLimit;
use axum::{routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use capts::app_state::AppState;
use capts::config::AppConfig;
use capts::routes;
use capts::services::connect::connect_with_retry;
use capts::services::kv::{KvBackend, RedisBackend};
use capts::services::queue::{AmqpBroker, Broker, Topology};
use capts::services::storage::BlobStore;
use capts::services::submit::CaptchaService;
use capts::services::tracker::TaskTracker;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing captcha server");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!(
        "captcha_tasks_submitted_total",
        "Total captchas accepted for recognition"
    );

    let retry = config.retry_policy();

    tracing::info!("Connecting to Redis");
    let kv: Arc<dyn KvBackend> = Arc::new(
        connect_with_retry("redis", retry, || RedisBackend::connect(&config.redis_url))
            .await
            .expect("Failed to connect to Redis"),
    );

    tracing::info!("Connecting to message broker");
    let broker: Arc<dyn Broker> = Arc::new(
        connect_with_retry("amqp", retry, || AmqpBroker::connect(&config.amqp_url))
            .await
            .expect("Failed to connect to message broker"),
    );

    let topology = Topology::from_config(&config);
    broker
        .declare_topology(&topology)
        .await
        .expect("Failed to declare broker topology");

    let blobs = BlobStore::new(Arc::clone(&kv), "default")
        .with_chunk_size(config.chunk_size)
        .with_ttl(config.blob_ttl());
    let tracker = TaskTracker::new(Arc::clone(&kv)).with_ttl(config.task_ttl());
    let captcha = CaptchaService::new(blobs, tracker, Arc::clone(&broker), &topology);

    let state = AppState::new(captcha, kv, broker);

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route(
            "/process_captcha/{captcha_type}",
            post(routes::captcha::submit_captcha),
        )
        .route("/result/{task_id}", get(routes::captcha::get_result))
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(10 * 1024 * 1024)); // 10 MB limit

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app).await.expect("Server error");
}
