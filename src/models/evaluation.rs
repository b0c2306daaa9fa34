use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::{JobType, KeyPlacement, PromptResponsePair};

/// Per-metric verdict labels derived from fixed score bands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricVerdicts {
    pub bias: String,
    pub toxicity: String,
    pub relevancy: String,
    pub faithfulness: String,
    pub overall: String,
}

/// Free-text reasoning per metric, as produced by the judge or the
/// degraded-fallback path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricReasoning {
    #[serde(default)]
    pub bias: Option<String>,
    #[serde(default)]
    pub toxicity: Option<String>,
    #[serde(default)]
    pub relevancy: Option<String>,
    #[serde(default)]
    pub faithfulness: Option<String>,
}

/// Blended scores for one evaluated response. All scores are in [0,1] or
/// null when no source produced a value; `degraded` marks bundles built
/// after every judge model was exhausted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationScoreBundle {
    pub bias: Option<f64>,
    pub toxicity: Option<f64>,
    pub relevancy: Option<f64>,
    pub faithfulness: Option<f64>,
    pub overall_score: Option<f64>,
    pub verdicts: MetricVerdicts,
    pub reasoning: MetricReasoning,
    #[serde(default)]
    pub degraded: bool,
}

/// Aggregate outcome of a finished job. Averages are over non-null scores
/// of successful items only; immutable once the job is terminal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub average_overall: Option<f64>,
    pub average_bias: Option<f64>,
    pub average_toxicity: Option<f64>,
}

impl JobSummary {
    pub fn empty() -> Self {
        Self {
            total: 0,
            successful: 0,
            failed: 0,
            average_overall: None,
            average_bias: None,
            average_toxicity: None,
        }
    }
}

/// Endpoint configuration as submitted by the caller; the API key arrives
/// in plaintext here and is encrypted before it reaches the job record.
#[derive(Debug, Deserialize, Validate)]
pub struct EndpointConfigRequest {
    #[garde(length(min = 1, max = 2000))]
    pub url: String,

    #[garde(length(min = 1, max = 20000))]
    pub request_template: String,

    #[garde(length(min = 1, max = 500))]
    pub response_path: String,

    #[garde(skip)]
    pub api_key: Option<String>,

    #[garde(skip)]
    #[serde(default)]
    pub key_placement: KeyPlacement,

    #[garde(inner(length(min = 1, max = 100)))]
    pub key_field: Option<String>,
}

/// Request to create an evaluation job.
#[derive(Debug, Deserialize, Validate)]
pub struct CreateJobRequest {
    /// External correlation key; generated when absent.
    #[garde(inner(length(min = 1, max = 100)))]
    pub job_id: Option<String>,

    #[garde(length(min = 1, max = 100))]
    pub user_id: String,

    #[garde(skip)]
    pub project_id: Uuid,

    #[garde(skip)]
    pub job_type: JobType,

    /// Required for automated endpoint tests.
    #[garde(dive)]
    pub endpoint: Option<EndpointConfigRequest>,

    /// Required for manual prompt tests.
    #[garde(skip)]
    pub pairs: Option<Vec<PromptResponsePair>>,
}

/// Response after submitting a job.
#[derive(Debug, Serialize)]
pub struct CreateJobResponse {
    pub job_id: String,
    pub status: String,
}

/// Job status read model consumed by the UI layer.
#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub job_id: String,
    pub status: String,
    pub progress: String,
    pub percent: i32,
    pub error: Option<String>,
}
