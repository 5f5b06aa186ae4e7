use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use garde::Validate;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::time::sleep;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use image_variant_worker::{
    config::AppConfig,
    db::{self, documents::PgDocumentStore},
    pipeline::orchestrator::{Orchestrator, PipelineOptions},
    routes::{self, health::HealthState},
    services::{
        colors::PaletteExtractor, detector::HttpDetector, progress::RedisProgress,
        queue::JobQueue, storage::S3Storage,
    },
};

const POLL_INTERVAL_MS: u64 = 1000; // 1 second
const QUEUE_DEPTH_INTERVAL_SECS: u64 = 30;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting image variant worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!("jobs_processed_total", "Total image jobs consumed");
    metrics::describe_counter!(
        "jobs_failed_total",
        "Jobs that finished with at least one failed unit"
    );
    metrics::describe_counter!("variants_uploaded_total", "Derived variants durably stored");
    metrics::describe_counter!("variants_failed_total", "Derived variants that failed to upload");
    metrics::describe_histogram!("job_duration_seconds", "End-to-end time to process one job");
    metrics::describe_gauge!("queue_depth", "Pending jobs in the queue");

    // Initialize database (listing document store)
    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    // Construct collaborators; the pipeline receives them, it never
    // reaches for process globals.
    tracing::info!("Initializing services");
    let storage = Arc::new(
        S3Storage::new(
            &config.s3_bucket,
            &config.s3_endpoint,
            &config.s3_region,
            &config.s3_access_key,
            &config.s3_secret_key,
        )
        .expect("Failed to initialize object storage"),
    );

    let detector = Arc::new(HttpDetector::new(
        config.detector_url.clone(),
        config.detector_api_token.clone(),
    ));

    let queue = Arc::new(JobQueue::new(&config.redis_url).expect("Failed to initialize job queue"));

    let progress =
        Arc::new(RedisProgress::new(&config.redis_url).expect("Failed to initialize progress store"));

    let documents = Arc::new(PgDocumentStore::new(db_pool.clone()));

    let orchestrator = Arc::new(Orchestrator::new(
        storage,
        detector,
        Arc::new(PaletteExtractor),
        documents,
        progress,
        PipelineOptions::from_config(&config),
    ));

    // Observability endpoints
    let health_state = HealthState {
        db: db_pool.clone(),
        queue: queue.clone(),
    };
    let app = Router::new()
        .route(
            "/health",
            get(routes::health::health_check).with_state(health_state),
        )
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind observability address");
    tracing::info!("Observability endpoints on {}", config.bind_addr);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "observability server error");
        }
    });

    // Periodic queue depth gauge
    {
        let queue = queue.clone();
        tokio::spawn(async move {
            loop {
                if let Ok(depth) = queue.queue_depth().await {
                    metrics::gauge!("queue_depth").set(depth as f64);
                }
                sleep(Duration::from_secs(QUEUE_DEPTH_INTERVAL_SECS)).await;
            }
        });
    }

    tracing::info!("Worker ready, starting job processing loop");

    loop {
        match process_next_job(&orchestrator, &queue).await {
            Ok(true) => {
                tracing::debug!("Job processed, checking for next job");
            }
            Ok(false) => {
                tracing::trace!("No jobs available, sleeping");
                sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Error consuming job, will retry");
                sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
            }
        }
    }
}

/// Consume the next job from the queue.
/// Returns Ok(true) if a job was consumed, Ok(false) if none available.
async fn process_next_job(
    orchestrator: &Arc<Orchestrator>,
    queue: &Arc<JobQueue>,
) -> Result<bool, Box<dyn std::error::Error>> {
    let queued = match queue.dequeue().await? {
        Some(job) => job,
        None => return Ok(false),
    };

    // Malformed payloads are dropped with a log instead of being
    // redelivered forever.
    if let Err(report) = queued.validate() {
        tracing::error!(job_id = %queued.id, error = %report, "malformed job payload, dropping");
        queue.complete(&queued).await?;
        return Ok(true);
    }
    if queued.images.is_empty() {
        tracing::info!(job_id = %queued.id, "job names no images, dropping");
        queue.complete(&queued).await?;
        return Ok(true);
    }

    let job = queued.clone().into_job();
    tracing::info!(
        job_id = %job.id,
        sources = job.sources.len(),
        "Processing image job"
    );

    let summary = orchestrator.process_job(job).await;

    metrics::counter!("jobs_processed_total").increment(1);
    if summary.failed > 0 {
        metrics::counter!("jobs_failed_total").increment(1);
    }

    queue.complete(&queued).await?;

    Ok(true)
}
