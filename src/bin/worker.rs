use capts::{
    config::AppConfig,
    services::{
        connect::connect_with_retry,
        kv::{KvBackend, RedisBackend},
        pipeline::pipeline_for,
        processor::Processor,
        queue::{AmqpBroker, Broker, Topology},
        recognizer::HttpRecognizer,
        storage::BlobStore,
        tracker::TaskTracker,
    },
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration");
    let job_type = config.job_type.expect("JOB_TYPE must be set for workers");
    let recognizer_url = config
        .recognizer_url
        .as_deref()
        .expect("RECOGNIZER_URL must be set for workers");

    tracing::info!(job_type = %job_type, "Starting captcha worker");

    // Recorder only; workers expose no scrape endpoint of their own
    PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    metrics::describe_histogram!(
        "captcha_processing_seconds",
        "Time to process one captcha message"
    );
    metrics::describe_counter!("captcha_tasks_finished_total", "Total tasks finished");
    metrics::describe_counter!("captcha_tasks_failed_total", "Total tasks marked failed");
    metrics::describe_counter!(
        "captcha_messages_dead_lettered_total",
        "Total messages rejected to the dead-letter exchange"
    );

    let retry = config.retry_policy();

    let kv: Arc<dyn KvBackend> = Arc::new(
        connect_with_retry("redis", retry, || RedisBackend::connect(&config.redis_url))
            .await
            .expect("Failed to connect to Redis"),
    );

    let broker = connect_with_retry("amqp", retry, || AmqpBroker::connect(&config.amqp_url))
        .await
        .expect("Failed to connect to message broker");

    broker
        .declare_topology(&Topology::from_config(&config))
        .await
        .expect("Failed to declare broker topology");

    let recognizer =
        HttpRecognizer::new(recognizer_url).expect("Failed to initialize recognizer client");

    let blobs = BlobStore::new(Arc::clone(&kv), job_type.namespace())
        .with_chunk_size(config.chunk_size)
        .with_ttl(config.blob_ttl());
    let tracker = TaskTracker::new(kv).with_ttl(config.task_ttl());

    let processor = Processor::new(
        pipeline_for(job_type, config.confidence_threshold),
        Arc::new(recognizer),
        blobs,
        tracker,
    )
    .with_consume_mode(config.blob_consume_mode);

    let queue = config.queue_for(job_type);
    let source = broker
        .consume(queue)
        .await
        .expect("Failed to start consuming");

    tracing::info!(queue = %queue, "Worker ready, consuming messages");

    let mut exit_code = 0;
    tokio::select! {
        result = processor.run(source) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Consume loop stopped");
                exit_code = 1;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    if let Err(e) = broker.close().await {
        tracing::warn!(error = %e, "Failed to close broker connection cleanly");
    }
    tracing::info!(exit_code, "Worker stopped");
    std::process::exit(exit_code);
}
