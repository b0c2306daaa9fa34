//! Job Processors
//!
//! Drive the fan-out/fan-in state machine for both job variants:
//! ownership check, work-item derivation, rate-limited sequential
//! dispatch, fan-in wait, and finalization hand-off. Also hosts the
//! per-item dispatch handler the worker invokes for each dispatch event.
//!
//! Every step tolerates redelivery: dispatches already recorded are
//! skipped, the aggregator's presence check drops duplicate completions,
//! and a processor resumed against a half-finished job picks up where
//! the per-item maps say it left off.

use std::time::Duration;

use tokio::time::sleep;

use crate::app_state::AppState;
use crate::db::queries::{self, StoreError};
use crate::models::job::{
    CollectedResponse, EvalJob, ItemResult, JobPayload, JobStatus, JobType, WorkItem,
};
use crate::services::encryption::EncryptionError;
use crate::services::evaluator::EvaluateError;
use crate::services::finalize;
use crate::services::progress;
use crate::services::queue::{DispatchPhase, ItemDispatch, QueueError};

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// Missing/malformed job payload or config; fatal, never retried.
    #[error("Invalid job: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Timed out waiting for {phase} fan-in after {timeout:?}")]
    FanInTimeout {
        phase: DispatchPhase,
        timeout: Duration,
    },

    #[error("Failed to decrypt endpoint API key: {0}")]
    Encryption(#[from] EncryptionError),
}

/// Entry point for one job-creation event. Errors are routed to the
/// failure handler, which records a terminal `failed` status with a
/// best-effort message; the event itself is always consumed.
pub async fn handle_job_event(state: &AppState, job_id: &str) {
    if let Err(e) = process_job(state, job_id).await {
        tracing::error!(job_id = %job_id, error = %e, "Job processing failed");
        if let Err(mark_err) = queries::mark_job_failed(&state.db, job_id, &e.to_string()).await {
            tracing::error!(job_id = %job_id, error = %mark_err, "Failed to record job failure");
        }
    }
}

async fn process_job(state: &AppState, job_id: &str) -> Result<(), ProcessError> {
    let job = queries::get_job(&state.db, job_id)
        .await?
        .ok_or_else(|| ProcessError::Validation(format!("unknown job {job_id}")))?;

    if job.status.is_terminal() {
        tracing::info!(job_id = %job_id, status = %job.status, "Job already terminal, skipping");
        return Ok(());
    }

    // Ownership check: fatal, not retried.
    let owned = queries::project_exists(&state.db, job.project_id, &job.user_id).await?;
    if !owned {
        return Err(ProcessError::Validation(format!(
            "project {} not found for user",
            job.project_id
        )));
    }

    match job.job_type {
        JobType::AutomatedEndpointTest => run_automated_job(state, job).await,
        JobType::ManualPromptTest => run_manual_job(state, job).await,
    }
}

/// Two-phase processor: collect endpoint responses (0-50%), then
/// evaluate the successful ones (50-100%).
async fn run_automated_job(state: &AppState, mut job: EvalJob) -> Result<(), ProcessError> {
    let job_id = job.job_id.clone();

    let JobPayload::AutomatedEndpointTest(payload) = &job.payload else {
        return Err(ProcessError::Validation(format!(
            "job {job_id} is automated but its payload is not"
        )));
    };

    // Derive work items from the shared prompt set, once.
    if payload.items.is_empty() && payload.collected.is_empty() {
        let items = queries::get_prompt_set(&state.db).await?;
        queries::set_work_items(&state.db, &job_id, &items).await?;
        job = reload(state, &job_id).await?;
    }

    let JobPayload::AutomatedEndpointTest(payload) = &job.payload else {
        return Err(ProcessError::Validation(format!(
            "job {job_id} payload changed shape mid-flight"
        )));
    };

    let total = payload.items.len();
    if total == 0 {
        finalize::finalize_job(&state.db, &job_id).await?;
        return Ok(());
    }

    tracing::info!(job_id = %job_id, total, "Starting collection phase");

    if job.status == JobStatus::CollectingResponses {
        let pending: Vec<&WorkItem> = payload
            .items
            .iter()
            .filter(|item| !payload.collected.contains_key(&item.index.to_string()))
            .collect();
        dispatch_items(state, &job_id, &pending, DispatchPhase::Collection).await?;

        if payload.collected.len() < total {
            wait_for_phase(state, &job_id, DispatchPhase::Collection, total).await?;
        }
        job = reload(state, &job_id).await?;
    }

    // All endpoint calls failed: the aggregator forced the job to failed
    // at 50 percent; record the summary and stop before evaluation.
    if job.status == JobStatus::Failed {
        tracing::warn!(job_id = %job_id, "Every endpoint call failed, skipping evaluation");
        finalize::finalize_job(&state.db, &job_id).await?;
        return Ok(());
    }

    let JobPayload::AutomatedEndpointTest(payload) = &job.payload else {
        return Err(ProcessError::Validation(format!(
            "job {job_id} payload changed shape mid-flight"
        )));
    };

    // Evaluation dispatch order follows original item index, not
    // collection completion order.
    let successful = progress::successful_collection_items(payload);
    tracing::info!(
        job_id = %job_id,
        successful = successful.len(),
        "Starting evaluation phase"
    );

    let pending: Vec<&WorkItem> = successful
        .iter()
        .filter(|item| !payload.evaluated.contains_key(&item.index.to_string()))
        .collect();
    dispatch_items(state, &job_id, &pending, DispatchPhase::Evaluation).await?;

    if payload.evaluated.len() < successful.len() {
        wait_for_phase(state, &job_id, DispatchPhase::Evaluation, successful.len()).await?;
    }

    finalize::finalize_job(&state.db, &job_id).await?;
    Ok(())
}

/// Single-phase processor over caller-supplied prompt/response pairs.
async fn run_manual_job(state: &AppState, job: EvalJob) -> Result<(), ProcessError> {
    let JobPayload::ManualPromptTest(payload) = &job.payload else {
        return Err(ProcessError::Validation(format!(
            "job {} is manual but its payload is not",
            job.job_id
        )));
    };

    let total = payload.pairs.len();
    if total == 0 {
        finalize::finalize_job(&state.db, &job.job_id).await?;
        return Ok(());
    }

    tracing::info!(job_id = %job.job_id, total, "Starting evaluation");

    let items: Vec<WorkItem> = payload
        .pairs
        .iter()
        .enumerate()
        .map(|(i, pair)| WorkItem {
            index: i as u32,
            category: pair.category.clone(),
            prompt_text: pair.prompt_text.clone(),
        })
        .collect();
    let pending: Vec<&WorkItem> = items
        .iter()
        .filter(|item| !payload.evaluated.contains_key(&item.index.to_string()))
        .collect();
    dispatch_items(state, &job.job_id, &pending, DispatchPhase::Evaluation).await?;

    if payload.evaluated.len() < total {
        wait_for_phase(state, &job.job_id, DispatchPhase::Evaluation, total).await?;
    }

    finalize::finalize_job(&state.db, &job.job_id).await?;
    Ok(())
}

/// Release dispatches sequentially with the configured minimum interval
/// between them; the delay is skipped before the first item.
async fn dispatch_items(
    state: &AppState,
    job_id: &str,
    items: &[&WorkItem],
    phase: DispatchPhase,
) -> Result<(), ProcessError> {
    for (position, item) in items.iter().enumerate() {
        if position > 0 {
            sleep(state.pipeline.dispatch_interval).await;
        }
        state
            .queue
            .enqueue_dispatch(&ItemDispatch {
                job_id: job_id.to_string(),
                index: item.index,
                category: item.category.clone(),
                prompt: item.prompt_text.clone(),
                phase,
            })
            .await?;
        tracing::debug!(job_id = %job_id, index = item.index, phase = %phase, "Dispatched item");
    }
    Ok(())
}

async fn wait_for_phase(
    state: &AppState,
    job_id: &str,
    phase: DispatchPhase,
    item_count: usize,
) -> Result<(), ProcessError> {
    let timeout = state.pipeline.fan_in_timeout(item_count);
    let signaled = state.queue.wait_fan_in(job_id, phase, timeout).await?;
    if signaled {
        Ok(())
    } else {
        Err(ProcessError::FanInTimeout { phase, timeout })
    }
}

async fn reload(state: &AppState, job_id: &str) -> Result<EvalJob, ProcessError> {
    queries::get_job(&state.db, job_id)
        .await?
        .ok_or_else(|| ProcessError::Validation(format!("job {job_id} disappeared")))
}

/// Handle one per-item dispatch event: execute the call, merge the
/// completion into the job record, and raise the fan-in signal on the
/// arrival that fills the final slot of the phase.
pub async fn handle_dispatch(state: &AppState, dispatch: &ItemDispatch) -> Result<(), ProcessError> {
    let job = queries::get_job(&state.db, &dispatch.job_id)
        .await?
        .ok_or_else(|| ProcessError::Validation(format!("unknown job {}", dispatch.job_id)))?;

    match dispatch.phase {
        DispatchPhase::Collection => handle_collection_dispatch(state, &job, dispatch).await,
        DispatchPhase::Evaluation => handle_evaluation_dispatch(state, &job, dispatch).await,
    }
}

async fn handle_collection_dispatch(
    state: &AppState,
    job: &EvalJob,
    dispatch: &ItemDispatch,
) -> Result<(), ProcessError> {
    let JobPayload::AutomatedEndpointTest(payload) = &job.payload else {
        return Err(ProcessError::Validation(format!(
            "collection dispatch for non-automated job {}",
            dispatch.job_id
        )));
    };

    let api_key = match &payload.endpoint.api_key {
        Some(sealed) => Some(state.encryption.decrypt_string(sealed)?),
        None => None,
    };

    let result = match state
        .endpoint
        .call(&payload.endpoint, api_key.as_deref(), &dispatch.prompt)
        .await
    {
        Ok(answer) => {
            tracing::debug!(job_id = %dispatch.job_id, index = dispatch.index, "Endpoint call succeeded");
            ItemResult::Ok {
                value: CollectedResponse { answer },
            }
        }
        Err(e) => {
            tracing::warn!(
                job_id = %dispatch.job_id,
                index = dispatch.index,
                error = %e,
                "Endpoint call failed"
            );
            ItemResult::Err {
                error: e.to_string(),
            }
        }
    };

    let outcome =
        queries::record_collection_result(&state.db, &dispatch.job_id, dispatch.index, result)
            .await?;
    metrics::counter!("endpoint_calls_total").increment(1);

    if outcome.newly_recorded && outcome.phase_complete {
        state
            .queue
            .signal_fan_in(&dispatch.job_id, DispatchPhase::Collection)
            .await?;
    }
    Ok(())
}

async fn handle_evaluation_dispatch(
    state: &AppState,
    job: &EvalJob,
    dispatch: &ItemDispatch,
) -> Result<(), ProcessError> {
    let response_text = response_for_item(job, dispatch.index)?;

    let result = match state
        .evaluator
        .evaluate(
            job.project_id,
            &dispatch.category,
            &dispatch.prompt,
            &response_text,
        )
        .await
    {
        Ok(bundle) => {
            if let Err(e) = queries::upsert_evaluation_score(
                &state.db,
                job.project_id,
                &job.user_id,
                &dispatch.category,
                &dispatch.prompt,
                &bundle,
            )
            .await
            {
                tracing::error!(
                    job_id = %dispatch.job_id,
                    index = dispatch.index,
                    error = %e,
                    "Failed to upsert evaluation score"
                );
            }
            ItemResult::Ok { value: bundle }
        }
        // Validation failures are per-item: recorded, never retried.
        Err(e @ EvaluateError::EmptyResponse) => ItemResult::Err {
            error: e.to_string(),
        },
    };

    let outcome =
        queries::record_evaluation_result(&state.db, &dispatch.job_id, dispatch.index, result)
            .await?;
    metrics::counter!("items_evaluated_total").increment(1);

    if outcome.newly_recorded && outcome.phase_complete {
        state
            .queue
            .signal_fan_in(&dispatch.job_id, DispatchPhase::Evaluation)
            .await?;
    }
    Ok(())
}

/// Resolve the text to evaluate for an item: the collected endpoint
/// answer for automated jobs, the caller-supplied response for manual
/// ones.
fn response_for_item(job: &EvalJob, index: u32) -> Result<String, ProcessError> {
    match &job.payload {
        JobPayload::AutomatedEndpointTest(payload) => payload
            .collected
            .get(&index.to_string())
            .and_then(|r| r.value())
            .map(|c| c.answer.clone())
            .ok_or_else(|| {
                ProcessError::Validation(format!(
                    "evaluation dispatched for item {index} with no collected response"
                ))
            }),
        JobPayload::ManualPromptTest(payload) => payload
            .pairs
            .get(index as usize)
            .map(|pair| pair.response_text.clone())
            .ok_or_else(|| {
                ProcessError::Validation(format!("manual job has no pair at index {index}"))
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::{EndpointConfig, ManualPayload, PromptResponsePair};
    use chrono::Utc;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn manual_job(pairs: Vec<PromptResponsePair>) -> EvalJob {
        EvalJob {
            id: Uuid::new_v4(),
            job_id: "job-1".into(),
            user_id: "user-1".into(),
            project_id: Uuid::new_v4(),
            job_type: JobType::ManualPromptTest,
            status: JobStatus::Evaluating,
            total_items: pairs.len() as i32,
            payload: JobPayload::ManualPromptTest(ManualPayload {
                pairs,
                evaluated: BTreeMap::new(),
                summary: None,
            }),
            progress: "0/0".into(),
            percent: 0,
            error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_response_for_manual_item() {
        let job = manual_job(vec![PromptResponsePair {
            category: "age".into(),
            prompt_text: "q".into(),
            response_text: "the response".into(),
        }]);
        assert_eq!(response_for_item(&job, 0).unwrap(), "the response");
        assert!(response_for_item(&job, 5).is_err());
    }

    #[test]
    fn test_response_for_automated_item_requires_collected_success() {
        let mut collected = BTreeMap::new();
        collected.insert(
            "0".to_string(),
            ItemResult::Ok {
                value: CollectedResponse {
                    answer: "collected answer".into(),
                },
            },
        );
        collected.insert(
            "1".to_string(),
            ItemResult::Err {
                error: "HTTP 500".into(),
            },
        );

        let job = EvalJob {
            payload: JobPayload::AutomatedEndpointTest(crate::models::job::AutomatedPayload {
                endpoint: EndpointConfig {
                    url: "https://api.example.com".into(),
                    request_template: r#"{"p": "{{PROMPT}}"}"#.into(),
                    response_path: "answer".into(),
                    api_key: None,
                    key_placement: Default::default(),
                    key_field: None,
                },
                items: vec![],
                collected,
                evaluated: BTreeMap::new(),
                summary: None,
            }),
            job_type: JobType::AutomatedEndpointTest,
            ..manual_job(vec![])
        };

        assert_eq!(response_for_item(&job, 0).unwrap(), "collected answer");
        // A failed collection slot never reaches evaluation.
        assert!(response_for_item(&job, 1).is_err());
        assert!(response_for_item(&job, 2).is_err());
    }
}
