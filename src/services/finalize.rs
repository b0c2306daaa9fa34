//! Finalizer
//!
//! Computes the job summary, writes the terminal status and persists the
//! immutable historical report for automated jobs. A history-persistence
//! failure is logged and swallowed; it never flips a finished job back to
//! failed.

use std::collections::BTreeMap;

use serde_json::Value;
use sqlx::PgPool;

use crate::db::queries::{self, JobReport, StoreError};
use crate::models::evaluation::{EvaluationScoreBundle, JobSummary};
use crate::models::job::{EvalJob, ItemResult, JobPayload, JobStatus, JobType};

const REDACTED: &str = "[REDACTED]";
const SECRET_PATTERNS: &[&str] = &["key", "token", "secret", "password"];

/// Aggregate evaluated results into a summary. `total` is the job's
/// item count; items that never produced an evaluation (for example
/// collection failures) count as failed. Averages cover non-null scores
/// of successful items only.
pub fn compute_summary(
    evaluated: &BTreeMap<String, ItemResult<EvaluationScoreBundle>>,
    total: usize,
) -> JobSummary {
    let successful_bundles: Vec<&EvaluationScoreBundle> =
        evaluated.values().filter_map(|r| r.value()).collect();

    let successful = successful_bundles.len();
    let failed = total.saturating_sub(successful);

    let average = |select: fn(&EvaluationScoreBundle) -> Option<f64>| -> Option<f64> {
        let values: Vec<f64> = successful_bundles.iter().filter_map(|b| select(b)).collect();
        if values.is_empty() {
            None
        } else {
            Some(crate::services::blend::round3(
                values.iter().sum::<f64>() / values.len() as f64,
            ))
        }
    };

    JobSummary {
        total,
        successful,
        failed,
        average_overall: average(|b| b.overall_score),
        average_bias: average(|b| b.bias),
        average_toxicity: average(|b| b.toxicity),
    }
}

/// Terminal status rule: failed iff zero successes (and work existed),
/// success iff zero failures, partial_success otherwise. Empty jobs
/// finish successful.
pub fn terminal_status(summary: &JobSummary) -> JobStatus {
    if summary.total == 0 {
        JobStatus::Success
    } else if summary.successful == 0 {
        JobStatus::Failed
    } else if summary.failed == 0 {
        JobStatus::Success
    } else {
        JobStatus::PartialSuccess
    }
}

/// Replace the value of any field whose name matches a secret-like
/// pattern, recursing through nested objects and arrays.
pub fn redact_secrets(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (name, entry) in map.iter_mut() {
                let lowered = name.to_ascii_lowercase();
                if SECRET_PATTERNS.iter().any(|p| lowered.contains(p)) {
                    *entry = Value::String(REDACTED.to_string());
                } else {
                    redact_secrets(entry);
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                redact_secrets(item);
            }
        }
        _ => {}
    }
}

/// Finalize a job: compute and persist the summary, write the terminal
/// status, and upsert the historical report for automated jobs.
pub async fn finalize_job(pool: &PgPool, job_id: &str) -> Result<JobSummary, StoreError> {
    let job = queries::get_job(pool, job_id)
        .await?
        .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;

    let evaluated = job.payload.evaluated();
    let summary = compute_summary(evaluated, job.total_items.max(0) as usize);

    // A collection phase where every endpoint call failed has already
    // forced the job to failed, locked at 50 percent; keep both.
    let (status, percent, progress) = if job.status == JobStatus::Failed {
        (JobStatus::Failed, job.percent, job.progress.clone())
    } else {
        let status = terminal_status(&summary);
        let done = evaluated.len();
        (status, 100, format!("{done}/{done}"))
    };

    queries::finalize_job_status(pool, job_id, status, percent, &progress, &summary).await?;

    tracing::info!(
        job_id = %job_id,
        status = %status,
        successful = summary.successful,
        failed = summary.failed,
        "Job finalized"
    );
    match status {
        JobStatus::Failed => metrics::counter!("eval_jobs_failed").increment(1),
        _ => metrics::counter!("eval_jobs_completed").increment(1),
    }

    if job.job_type == JobType::AutomatedEndpointTest {
        if let Err(e) = persist_report(pool, &job, &summary).await {
            // Never fail a finished job over its history row.
            tracing::error!(job_id = %job_id, error = %e, "Failed to persist job report");
        }
    }

    Ok(summary)
}

async fn persist_report(
    pool: &PgPool,
    job: &EvalJob,
    summary: &JobSummary,
) -> Result<(), StoreError> {
    let JobPayload::AutomatedEndpointTest(payload) = &job.payload else {
        return Ok(());
    };

    let item_by_index = |index: &str| {
        index
            .parse::<u32>()
            .ok()
            .and_then(|i| payload.items.iter().find(|item| item.index == i))
    };

    let mut results = Vec::new();
    let mut errors = Vec::new();

    for (index, result) in &payload.collected {
        if let Some(error) = result.error() {
            errors.push(serde_json::json!({
                "index": index.parse::<u32>().ok(),
                "category": item_by_index(index).map(|i| i.category.clone()),
                "phase": "collection",
                "error": error,
            }));
        }
    }

    for (index, result) in &payload.evaluated {
        let item = item_by_index(index);
        match result {
            ItemResult::Ok { value } => results.push(serde_json::json!({
                "index": index.parse::<u32>().ok(),
                "category": item.map(|i| i.category.clone()),
                "prompt": item.map(|i| i.prompt_text.clone()),
                "scores": value,
            })),
            ItemResult::Err { error } => errors.push(serde_json::json!({
                "index": index.parse::<u32>().ok(),
                "category": item.map(|i| i.category.clone()),
                "phase": "evaluation",
                "error": error,
            })),
        }
    }

    let mut config = serde_json::to_value(&payload.endpoint)?;
    redact_secrets(&mut config);

    queries::upsert_job_report(
        pool,
        &JobReport {
            job_id: job.job_id.clone(),
            summary: summary.clone(),
            results: Value::Array(results),
            errors: Value::Array(errors),
            config,
        },
    )
    .await
}
