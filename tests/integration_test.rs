use std::collections::BTreeMap;

use fairlens::{
    config::AppConfig,
    db::{self, queries::{self, NewJob}},
    models::evaluation::EvaluationScoreBundle,
    models::job::{ItemResult, JobPayload, JobStatus, JobType, ManualPayload, PromptResponsePair},
    services::blend,
    services::queue::{DispatchPhase, JobQueue, QueuedJob},
};
use uuid::Uuid;

fn passing_bundle() -> EvaluationScoreBundle {
    EvaluationScoreBundle {
        bias: Some(0.1),
        toxicity: Some(0.05),
        relevancy: Some(0.9),
        faithfulness: Some(0.85),
        overall_score: Some(0.9),
        verdicts: blend::verdicts(Some(0.1), Some(0.05), Some(0.9), Some(0.85), Some(0.9)),
        reasoning: Default::default(),
        degraded: false,
    }
}

/// Integration test: full job record flow
///
/// This test verifies the complete integration:
/// 1. Database connection and schema
/// 2. Job record creation and retrieval
/// 3. Idempotent per-item completion merges and progress math
/// 4. Finalization (summary, terminal status)
/// 5. Queue operations (enqueue/dequeue/fan-in)
///
/// Note: This requires a running PostgreSQL and Redis instance
/// configured via environment variables.
#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_full_integration() {
    // Load config from environment
    let config = AppConfig::from_env().expect("Failed to load config");

    // Initialize database
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run migrations");

    let queue = JobQueue::new(&config.redis_url).expect("Failed to initialize queue");

    // Test project (ownership check target)
    let user_id = format!("test-user-{}", Uuid::new_v4());
    let project_id: Uuid = sqlx::query_scalar(
        "INSERT INTO projects (owner_id, name) VALUES ($1, 'integration-test') RETURNING id",
    )
    .bind(&user_id)
    .fetch_one(&db_pool)
    .await
    .expect("Failed to create project");

    assert!(queries::project_exists(&db_pool, project_id, &user_id)
        .await
        .expect("ownership check failed"));

    // 1. Create a manual job with three pairs
    let pairs: Vec<PromptResponsePair> = (0..3)
        .map(|i| PromptResponsePair {
            category: "gender".to_string(),
            prompt_text: format!("prompt {i}"),
            response_text: format!("response {i}"),
        })
        .collect();

    let external_id = format!("it-job-{}", Uuid::new_v4());
    let job = queries::create_job(
        &db_pool,
        &NewJob {
            job_id: external_id.clone(),
            user_id: user_id.clone(),
            project_id,
            job_type: JobType::ManualPromptTest,
            status: JobStatus::Evaluating,
            total_items: 3,
            payload: JobPayload::ManualPromptTest(ManualPayload {
                pairs,
                evaluated: BTreeMap::new(),
                summary: None,
            }),
        },
    )
    .await
    .expect("Failed to create job");

    assert_eq!(job.status, JobStatus::Evaluating);
    assert_eq!(job.total_items, 3);
    assert_eq!(job.progress, "0/3");

    // 2. Record completions out of order, items 0 and 2 succeed, 1 fails
    let outcome = queries::record_evaluation_result(
        &db_pool,
        &external_id,
        2,
        ItemResult::Ok {
            value: passing_bundle(),
        },
    )
    .await
    .expect("record failed");
    assert!(outcome.newly_recorded);
    assert_eq!(outcome.percent, 33);

    // Duplicate delivery of item 2 is a no-op
    let duplicate = queries::record_evaluation_result(
        &db_pool,
        &external_id,
        2,
        ItemResult::Ok {
            value: passing_bundle(),
        },
    )
    .await
    .expect("duplicate record failed");
    assert!(!duplicate.newly_recorded);
    assert_eq!(duplicate.percent, 33);

    queries::record_evaluation_result(
        &db_pool,
        &external_id,
        1,
        ItemResult::Err {
            error: "response text is empty".to_string(),
        },
    )
    .await
    .expect("record failed");

    let last = queries::record_evaluation_result(
        &db_pool,
        &external_id,
        0,
        ItemResult::Ok {
            value: passing_bundle(),
        },
    )
    .await
    .expect("record failed");
    assert!(last.phase_complete);
    assert_eq!(last.percent, 100);
    assert_eq!(last.progress, "3/3");

    // 3. Finalize: 2 successes + 1 failure = partial_success
    let summary = fairlens::services::finalize::finalize_job(&db_pool, &external_id)
        .await
        .expect("finalize failed");
    assert_eq!(summary.successful, 2);
    assert_eq!(summary.failed, 1);

    let finished = queries::get_job(&db_pool, &external_id)
        .await
        .expect("get failed")
        .expect("job missing");
    assert_eq!(finished.status, JobStatus::PartialSuccess);
    assert_eq!(finished.percent, 100);

    // 4. Queue round-trip and fan-in signaling
    let queued = QueuedJob {
        job_id: external_id.clone(),
    };
    queue.enqueue_job(&queued).await.expect("enqueue failed");
    let dequeued = queue
        .dequeue_job()
        .await
        .expect("dequeue failed")
        .expect("queue empty");
    assert_eq!(dequeued.job_id, external_id);
    queue.complete_job(&dequeued).await.expect("complete failed");

    queue
        .signal_fan_in(&external_id, DispatchPhase::Evaluation)
        .await
        .expect("signal failed");
    let signaled = queue
        .wait_fan_in(
            &external_id,
            DispatchPhase::Evaluation,
            std::time::Duration::from_secs(2),
        )
        .await
        .expect("wait failed");
    assert!(signaled);

    // A second wait must time out (the signal fires once)
    let timed_out = queue
        .wait_fan_in(
            &external_id,
            DispatchPhase::Evaluation,
            std::time::Duration::from_secs(1),
        )
        .await
        .expect("wait failed");
    assert!(!timed_out);
}
