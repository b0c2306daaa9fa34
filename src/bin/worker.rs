use std::time::Duration;

use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

use fairlens::app_state::{AppState, PipelineSettings};
use fairlens::config::AppConfig;
use fairlens::db;
use fairlens::services::processor::{self, ProcessError};
use fairlens::services::{
    encryption::EncryptionService, endpoint::EndpointCaller, evaluator::Evaluator,
    fairness::FairnessHandle, judge::JudgeHandle, queue::JobQueue, retry::RetryPolicy,
};

const POLL_INTERVAL_MS: u64 = 1000; // 1 second

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting evaluation worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    // Initialize database
    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Initialize services
    tracing::info!("Initializing services");
    let encryption =
        EncryptionService::new(&config.encryption_key).expect("Failed to initialize encryption");

    let queue = JobQueue::new(&config.redis_url).expect("Failed to initialize job queue");

    let judge = JudgeHandle::from_config(
        config.judge_api_key.clone(),
        config.judge_base_url.clone(),
        config.judge_models.clone(),
        RetryPolicy::default(),
    );
    let fairness = FairnessHandle::from_config(
        config.fairness_service_url.clone(),
        Duration::from_secs(config.fairness_timeout_secs),
    );
    let evaluator = Evaluator::new(judge, fairness);

    let pipeline = PipelineSettings::from_config(&config);
    let state = AppState::new(
        db_pool,
        queue,
        encryption,
        EndpointCaller::new(),
        evaluator,
        pipeline,
    );

    tracing::info!("Worker ready, starting job and dispatch loops");

    // Per-item dispatches are consumed independently of the job loop so
    // a processor blocked on a fan-in wait never starves its own items.
    let dispatch_state = state.clone();
    tokio::spawn(async move {
        dispatch_loop(dispatch_state).await;
    });

    job_loop(state).await;
}

/// Consume job-creation events; each job runs in its own task so the
/// loop keeps draining while processors sit in fan-in waits.
async fn job_loop(state: AppState) {
    loop {
        match state.queue.dequeue_job().await {
            Ok(Some(queued)) => {
                tracing::info!(job_id = %queued.job_id, "Processing job");
                let state = state.clone();
                tokio::spawn(async move {
                    processor::handle_job_event(&state, &queued.job_id).await;
                    if let Err(e) = state.queue.complete_job(&queued).await {
                        tracing::error!(job_id = %queued.job_id, error = %e, "Failed to complete job event");
                    }
                });
            }
            Ok(None) => {
                tracing::trace!("No jobs available, sleeping");
                sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Error polling job queue, will retry");
                sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
            }
        }
    }
}

/// Consume per-item dispatch events. Transient failures re-enqueue the
/// dispatch (at-least-once; the aggregator drops the duplicate merge),
/// fatal ones are logged and dropped.
async fn dispatch_loop(state: AppState) {
    loop {
        match state.queue.dequeue_dispatch().await {
            Ok(Some(dispatch)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    match processor::handle_dispatch(&state, &dispatch).await {
                        Ok(()) => {}
                        Err(ProcessError::Validation(msg)) => {
                            tracing::error!(
                                job_id = %dispatch.job_id,
                                index = dispatch.index,
                                error = %msg,
                                "Dropping invalid dispatch"
                            );
                        }
                        Err(e) => {
                            tracing::error!(
                                job_id = %dispatch.job_id,
                                index = dispatch.index,
                                error = %e,
                                "Dispatch failed, re-enqueueing"
                            );
                            if let Err(requeue_err) = state.queue.enqueue_dispatch(&dispatch).await
                            {
                                tracing::error!(
                                    job_id = %dispatch.job_id,
                                    error = %requeue_err,
                                    "Failed to re-enqueue dispatch"
                                );
                            }
                        }
                    }
                    if let Err(e) = state.queue.complete_dispatch(&dispatch).await {
                        tracing::error!(job_id = %dispatch.job_id, error = %e, "Failed to complete dispatch event");
                    }
                });
            }
            Ok(None) => {
                if let Ok(depth) = state.queue.dispatch_depth().await {
                    metrics::gauge!("dispatch_queue_depth").set(depth as f64);
                }
                sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Error polling dispatch queue, will retry");
                sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
            }
        }
    }
}
