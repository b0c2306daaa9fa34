use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::db::queries::{self, NewJob};
use crate::models::evaluation::{CreateJobRequest, CreateJobResponse, JobStatusResponse};
use crate::models::job::{
    AutomatedPayload, EndpointConfig, JobPayload, JobStatus, JobType, ManualPayload,
};
use crate::services::queue::QueuedJob;

/// POST /api/v1/jobs — Submit an evaluation job.
pub async fn submit_job(
    State(state): State<AppState>,
    Json(request): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<CreateJobResponse>), StatusCode> {
    if let Err(report) = request.validate() {
        tracing::debug!(error = %report, "Rejected invalid job request");
        return Err(StatusCode::BAD_REQUEST);
    }

    let owned = queries::project_exists(&state.db, request.project_id, &request.user_id)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Project ownership check failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    if !owned {
        return Err(StatusCode::NOT_FOUND);
    }

    let (status, total_items, payload) = match request.job_type {
        JobType::AutomatedEndpointTest => {
            let endpoint = request.endpoint.ok_or(StatusCode::BAD_REQUEST)?;

            // Never store plaintext credentials in the job payload.
            let api_key = match endpoint.api_key.as_deref() {
                Some(key) if !key.is_empty() => Some(
                    state
                        .encryption
                        .encrypt_string(key)
                        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?,
                ),
                _ => None,
            };

            let payload = JobPayload::AutomatedEndpointTest(AutomatedPayload {
                endpoint: EndpointConfig {
                    url: endpoint.url,
                    request_template: endpoint.request_template,
                    response_path: endpoint.response_path,
                    api_key,
                    key_placement: endpoint.key_placement,
                    key_field: endpoint.key_field,
                },
                items: Vec::new(),
                collected: Default::default(),
                evaluated: Default::default(),
                summary: None,
            });
            // total_items is fixed later, when the prompt set is derived.
            (JobStatus::CollectingResponses, 0, payload)
        }
        JobType::ManualPromptTest => {
            let pairs = request.pairs.ok_or(StatusCode::BAD_REQUEST)?;
            let total = pairs.len() as i32;
            let payload = JobPayload::ManualPromptTest(ManualPayload {
                pairs,
                evaluated: Default::default(),
                summary: None,
            });
            (JobStatus::Evaluating, total, payload)
        }
    };

    let job_id = request
        .job_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let job = queries::create_job(
        &state.db,
        &NewJob {
            job_id: job_id.clone(),
            user_id: request.user_id,
            project_id: request.project_id,
            job_type: request.job_type,
            status,
            total_items,
            payload,
        },
    )
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "Failed to create job record");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    state
        .queue
        .enqueue_job(&QueuedJob {
            job_id: job.job_id.clone(),
        })
        .await
        .map_err(|e| {
            tracing::error!(job_id = %job.job_id, error = %e, "Failed to enqueue job");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    metrics::counter!("eval_jobs_total").increment(1);
    tracing::info!(job_id = %job.job_id, job_type = %job.job_type, "Job submitted");

    Ok((
        StatusCode::ACCEPTED,
        Json(CreateJobResponse {
            job_id: job.job_id,
            status: job.status.to_string(),
        }),
    ))
}

/// GET /api/v1/jobs/{job_id} — Job status read model.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatusResponse>, StatusCode> {
    let job = queries::get_job(&state.db, &job_id)
        .await
        .map_err(|e| {
            tracing::error!(job_id = %job_id, error = %e, "Failed to load job");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(JobStatusResponse {
        job_id: job.job_id,
        status: job.status.to_string(),
        progress: job.progress,
        percent: job.percent,
        error: job.error,
    }))
}
