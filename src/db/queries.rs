use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::models::evaluation::{EvaluationScoreBundle, JobSummary};
use crate::models::job::{
    CollectedResponse, EvalJob, ItemResult, JobPayload, JobStatus, JobType, WorkItem,
};
use crate::services::progress::{self, MergeOutcome};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Corrupt job payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Invalid stored enum value: {0}")]
    Enum(String),

    #[error("Job {0} payload does not match its job type")]
    PayloadShape(String),
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<EvalJob, StoreError> {
    let job_type_str: String = row.try_get("job_type")?;
    let status_str: String = row.try_get("status")?;
    let payload_value: serde_json::Value = row.try_get("payload")?;

    Ok(EvalJob {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        user_id: row.try_get("user_id")?,
        project_id: row.try_get("project_id")?,
        job_type: job_type_str
            .parse::<JobType>()
            .map_err(|_| StoreError::Enum(job_type_str))?,
        status: status_str
            .parse::<JobStatus>()
            .map_err(|_| StoreError::Enum(status_str))?,
        total_items: row.try_get("total_items")?,
        payload: serde_json::from_value(payload_value)?,
        progress: row.try_get("progress")?,
        percent: row.try_get("percent")?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const JOB_COLUMNS: &str = "id, job_id, user_id, project_id, job_type, status, total_items, \
                           payload, progress, percent, error, created_at, updated_at";

/// Fields needed to insert a new evaluation job.
pub struct NewJob {
    pub job_id: String,
    pub user_id: String,
    pub project_id: Uuid,
    pub job_type: JobType,
    pub status: JobStatus,
    pub total_items: i32,
    pub payload: JobPayload,
}

/// Insert a new evaluation job record.
pub async fn create_job(pool: &PgPool, new_job: &NewJob) -> Result<EvalJob, StoreError> {
    let payload = serde_json::to_value(&new_job.payload)?;
    let progress = format!("0/{}", new_job.total_items);

    let row = sqlx::query(&format!(
        r#"
        INSERT INTO eval_jobs (job_id, user_id, project_id, job_type, status, total_items, payload, progress)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING {JOB_COLUMNS}
        "#,
    ))
    .bind(&new_job.job_id)
    .bind(&new_job.user_id)
    .bind(new_job.project_id)
    .bind(new_job.job_type.to_string())
    .bind(new_job.status.to_string())
    .bind(new_job.total_items)
    .bind(payload)
    .bind(progress)
    .fetch_one(pool)
    .await?;

    job_from_row(&row)
}

/// Get a job by its external correlation key.
pub async fn get_job(pool: &PgPool, job_id: &str) -> Result<Option<EvalJob>, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM eval_jobs WHERE job_id = $1"
    ))
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Check that the referenced project exists and belongs to the user.
pub async fn project_exists(
    pool: &PgPool,
    project_id: Uuid,
    user_id: &str,
) -> Result<bool, StoreError> {
    let row = sqlx::query("SELECT 1 AS one FROM projects WHERE id = $1 AND owner_id = $2")
        .bind(project_id)
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.is_some())
}

/// Fetch the shared prompt set, ordered by position, as work items.
pub async fn get_prompt_set(pool: &PgPool) -> Result<Vec<WorkItem>, StoreError> {
    let rows = sqlx::query("SELECT category, prompt_text FROM prompts ORDER BY position ASC")
        .fetch_all(pool)
        .await?;

    Ok(rows
        .iter()
        .enumerate()
        .map(|(i, row)| {
            Ok(WorkItem {
                index: i as u32,
                category: row.try_get("category")?,
                prompt_text: row.try_get("prompt_text")?,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()?)
}

/// Fix the derived work items and total on an automated job, once, before
/// fan-out begins.
pub async fn set_work_items(
    pool: &PgPool,
    job_id: &str,
    items: &[WorkItem],
) -> Result<(), StoreError> {
    let items_json = serde_json::to_value(items)?;
    let total = items.len() as i32;

    sqlx::query(
        r#"
        UPDATE eval_jobs
        SET payload = jsonb_set(payload, '{items}', $1::jsonb, true),
            total_items = $2,
            progress = $3,
            updated_at = NOW()
        WHERE job_id = $4
        "#,
    )
    .bind(items_json)
    .bind(total)
    .bind(format!("0/{total}"))
    .bind(job_id)
    .execute(pool)
    .await?;

    Ok(())
}

async fn lock_job(
    tx: &mut Transaction<'_, Postgres>,
    job_id: &str,
) -> Result<EvalJob, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM eval_jobs WHERE job_id = $1 FOR UPDATE"
    ))
    .bind(job_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;

    job_from_row(&row)
}

/// Write a merged item slot plus the derived progress fields. The payload
/// write targets one key path only; concurrent writers for other items
/// never clobber it because the row is locked for the duration of the
/// read-merge-write.
async fn write_merge(
    tx: &mut Transaction<'_, Postgres>,
    job_db_id: Uuid,
    map_key: &str,
    index: u32,
    slot_value: serde_json::Value,
    outcome: &MergeOutcome,
    status_change: Option<JobStatus>,
) -> Result<(), StoreError> {
    let path: Vec<String> = vec![map_key.to_string(), index.to_string()];

    sqlx::query(
        r#"
        UPDATE eval_jobs
        SET payload = jsonb_set(payload, $1::text[], $2::jsonb, true),
            progress = $3,
            percent = $4,
            status = COALESCE($5, status),
            updated_at = NOW()
        WHERE id = $6
        "#,
    )
    .bind(path)
    .bind(slot_value)
    .bind(&outcome.progress)
    .bind(outcome.percent)
    .bind(status_change.map(|s| s.to_string()))
    .bind(job_db_id)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Record one collection-phase completion. Idempotent: a duplicate
/// delivery leaves the row untouched and reports `newly_recorded = false`.
pub async fn record_collection_result(
    pool: &PgPool,
    job_id: &str,
    index: u32,
    result: ItemResult<CollectedResponse>,
) -> Result<MergeOutcome, StoreError> {
    let mut tx = pool.begin().await?;
    let mut job = lock_job(&mut tx, job_id).await?;

    let JobPayload::AutomatedEndpointTest(payload) = &mut job.payload else {
        return Err(StoreError::PayloadShape(job_id.to_string()));
    };

    let total = job.total_items.max(0) as usize;
    let outcome = progress::record_collection(payload, total, index, result);

    if outcome.newly_recorded {
        // A job already failed (e.g. fan-in timeout) must stay failed;
        // late completions only merge their slot.
        let status_change = outcome
            .status_change
            .filter(|_| !job.status.is_terminal());
        let slot_value = serde_json::to_value(&payload.collected[&index.to_string()])?;
        write_merge(
            &mut tx,
            job.id,
            "collected",
            index,
            slot_value,
            &outcome,
            status_change,
        )
        .await?;
    }

    tx.commit().await?;
    Ok(outcome)
}

/// Record one evaluation-phase completion. The phase denominator is the
/// number of evaluation dispatches: successfully collected items for
/// automated jobs, all pairs for manual ones.
pub async fn record_evaluation_result(
    pool: &PgPool,
    job_id: &str,
    index: u32,
    result: ItemResult<EvaluationScoreBundle>,
) -> Result<MergeOutcome, StoreError> {
    let mut tx = pool.begin().await?;
    let mut job = lock_job(&mut tx, job_id).await?;

    let (evaluated, phase_total, two_phase) = match &mut job.payload {
        JobPayload::AutomatedEndpointTest(payload) => {
            let successes = payload.collected.values().filter(|r| r.is_ok()).count();
            (&mut payload.evaluated, successes, true)
        }
        JobPayload::ManualPromptTest(payload) => {
            let total = payload.pairs.len();
            (&mut payload.evaluated, total, false)
        }
    };

    let outcome = progress::record_evaluation(evaluated, phase_total, two_phase, index, result);

    if outcome.newly_recorded {
        let slot_value = serde_json::to_value(&evaluated[&index.to_string()])?;
        write_merge(&mut tx, job.id, "evaluated", index, slot_value, &outcome, None).await?;
    }

    tx.commit().await?;
    Ok(outcome)
}

/// Write a terminal status, its progress fields and the one-time summary.
pub async fn finalize_job_status(
    pool: &PgPool,
    job_id: &str,
    status: JobStatus,
    percent: i32,
    progress: &str,
    summary: &JobSummary,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE eval_jobs
        SET status = $1,
            percent = $2,
            progress = $3,
            payload = jsonb_set(payload, '{summary}', $4::jsonb, true),
            updated_at = NOW()
        WHERE job_id = $5
        "#,
    )
    .bind(status.to_string())
    .bind(percent)
    .bind(progress)
    .bind(serde_json::to_value(summary)?)
    .bind(job_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Best-effort failure handler target: mark a job failed with a message,
/// unless it already reached a terminal status.
pub async fn mark_job_failed(
    pool: &PgPool,
    job_id: &str,
    message: &str,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE eval_jobs
        SET status = 'failed', error = $1, updated_at = NOW()
        WHERE job_id = $2 AND status NOT IN ('success', 'partial_success', 'failed')
        "#,
    )
    .bind(message)
    .bind(job_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Upsert one blended score bundle, keyed by (project, user, category,
/// prompt); re-evaluation overwrites.
pub async fn upsert_evaluation_score(
    pool: &PgPool,
    project_id: Uuid,
    user_id: &str,
    category: &str,
    prompt_text: &str,
    bundle: &EvaluationScoreBundle,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO evaluation_scores
            (project_id, user_id, category, prompt_text, bias, toxicity, relevancy,
             faithfulness, overall_score, verdicts, reasoning, degraded)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        ON CONFLICT (project_id, user_id, category, prompt_text)
        DO UPDATE SET
            bias = EXCLUDED.bias,
            toxicity = EXCLUDED.toxicity,
            relevancy = EXCLUDED.relevancy,
            faithfulness = EXCLUDED.faithfulness,
            overall_score = EXCLUDED.overall_score,
            verdicts = EXCLUDED.verdicts,
            reasoning = EXCLUDED.reasoning,
            degraded = EXCLUDED.degraded,
            updated_at = NOW()
        "#,
    )
    .bind(project_id)
    .bind(user_id)
    .bind(category)
    .bind(prompt_text)
    .bind(bundle.bias)
    .bind(bundle.toxicity)
    .bind(bundle.relevancy)
    .bind(bundle.faithfulness)
    .bind(bundle.overall_score)
    .bind(serde_json::to_value(&bundle.verdicts)?)
    .bind(serde_json::to_value(&bundle.reasoning)?)
    .bind(bundle.degraded)
    .execute(pool)
    .await?;

    Ok(())
}

/// Historical report row for a finished automated job.
pub struct JobReport {
    pub job_id: String,
    pub summary: JobSummary,
    pub results: serde_json::Value,
    pub errors: serde_json::Value,
    pub config: serde_json::Value,
}

/// Upsert the historical report, keyed by job id.
pub async fn upsert_job_report(pool: &PgPool, report: &JobReport) -> Result<(), StoreError> {
    let averages = serde_json::json!({
        "overall": report.summary.average_overall,
        "bias": report.summary.average_bias,
        "toxicity": report.summary.average_toxicity,
    });

    sqlx::query(
        r#"
        INSERT INTO job_reports
            (job_id, total_prompts, success_count, failure_count, average_scores,
             results, errors, config)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (job_id)
        DO UPDATE SET
            total_prompts = EXCLUDED.total_prompts,
            success_count = EXCLUDED.success_count,
            failure_count = EXCLUDED.failure_count,
            average_scores = EXCLUDED.average_scores,
            results = EXCLUDED.results,
            errors = EXCLUDED.errors,
            config = EXCLUDED.config,
            updated_at = NOW()
        "#,
    )
    .bind(&report.job_id)
    .bind(report.summary.total as i32)
    .bind(report.summary.successful as i32)
    .bind(report.summary.failed as i32)
    .bind(averages)
    .bind(&report.results)
    .bind(&report.errors)
    .bind(&report.config)
    .execute(pool)
    .await?;

    Ok(())
}
