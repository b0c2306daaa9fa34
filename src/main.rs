use axum::{routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use fairlens::app_state::{AppState, PipelineSettings};
use fairlens::config::AppConfig;
use fairlens::db;
use fairlens::routes;
use fairlens::services::{
    encryption::EncryptionService, endpoint::EndpointCaller, evaluator::Evaluator,
    fairness::FairnessHandle, judge::JudgeHandle, queue::JobQueue, retry::RetryPolicy,
};

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

    tracing::info!("Initializing fairlens server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    // Register application metrics
    metrics::describe_counter!("eval_jobs_total", "Total evaluation jobs submitted");
    metrics::describe_counter!("eval_jobs_completed", "Total evaluation jobs completed");
    metrics::describe_counter!("eval_jobs_failed", "Total evaluation jobs that failed");
    metrics::describe_counter!("endpoint_calls_total", "Total user-endpoint calls dispatched");
    metrics::describe_counter!("items_evaluated_total", "Total per-item evaluations completed");
    metrics::describe_counter!("judge_retries_total", "Total judge call retries");
    metrics::describe_counter!(
        "judge_exhausted_total",
        "Total evaluations where every judge model was exhausted"
    );
    metrics::describe_gauge!(
        "dispatch_queue_depth",
        "Current number of pending per-item dispatches"
    );

    // Initialize database connection pool
    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Run database migrations
    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    // Initialize encryption service
    tracing::info!("Initializing AES-256-GCM encryption");
    let encryption =
        EncryptionService::new(&config.encryption_key).expect("Failed to initialize encryption");

    // Initialize Redis job queue
    tracing::info!("Connecting to Redis job queue");
    let queue = JobQueue::new(&config.redis_url).expect("Failed to initialize job queue");

    // Initialize scoring backends
    tracing::info!("Initializing evaluation backends");
    let judge = JudgeHandle::from_config(
        config.judge_api_key.clone(),
        config.judge_base_url.clone(),
        config.judge_models.clone(),
        RetryPolicy::default(),
    );
    let fairness = FairnessHandle::from_config(
        config.fairness_service_url.clone(),
        std::time::Duration::from_secs(config.fairness_timeout_secs),
    );
    let evaluator = Evaluator::new(judge, fairness);

    // Create shared application state
    let pipeline = PipelineSettings::from_config(&config);
    let state = AppState::new(
        db_pool,
        queue,
        encryption,
        EndpointCaller::new(),
        evaluator,
        pipeline,
    );

    // Build API routes
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/api/v1/jobs", post(routes::jobs::submit_job))
        .route("/api/v1/jobs/{job_id}", get(routes::jobs::get_job_status))
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(2 * 1024 * 1024)); // 2 MB limit

    tracing::info!("Starting fairlens on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .await
        .expect("Server error");
}
