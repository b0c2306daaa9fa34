use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::models::evaluation::{EvaluationScoreBundle, JobSummary};

/// Kind of evaluation job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobType {
    AutomatedEndpointTest,
    ManualPromptTest,
}

/// Status of an evaluation job. Forward-only: the two interim phases may
/// only advance, and terminal states are never left.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    CollectingResponses,
    Evaluating,
    Success,
    PartialSuccess,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::PartialSuccess | JobStatus::Failed
        )
    }
}

/// One prompt/category pair. `index` is the stable aggregation key;
/// items are immutable once enqueued.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkItem {
    pub index: u32,
    pub category: String,
    pub prompt_text: String,
}

/// A caller-supplied prompt/response pair for manual jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptResponsePair {
    pub category: String,
    pub prompt_text: String,
    pub response_text: String,
}

/// Outcome of one fan-out branch, keyed by item index in the payload maps.
/// Each index transitions absent -> present exactly once; duplicate arrivals
/// are dropped by the aggregator's presence check.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemResult<T> {
    Ok { value: T },
    Err { error: String },
}

impl<T> ItemResult<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, ItemResult::Ok { .. })
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            ItemResult::Ok { value } => Some(value),
            ItemResult::Err { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            ItemResult::Ok { .. } => None,
            ItemResult::Err { error } => Some(error),
        }
    }
}

/// Where the stored API key is injected into the outbound endpoint request.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum KeyPlacement {
    #[default]
    None,
    AuthHeader,
    XApiKey,
    QueryParam,
    BodyField,
}

/// Stored configuration for calling a user's endpoint.
///
/// `api_key` holds AES-256-GCM ciphertext (base64) produced at job creation;
/// it is decrypted only at dispatch time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub url: String,
    pub request_template: String,
    pub response_path: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub key_placement: KeyPlacement,
    #[serde(default)]
    pub key_field: Option<String>,
}

/// Endpoint output captured during the collection phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectedResponse {
    pub answer: String,
}

/// Phase-specific job state, tagged by job type. Writers merge into the
/// per-item maps at a specific key path; the whole document is never
/// replaced once fan-out has begun.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "job_type", rename_all = "snake_case")]
pub enum JobPayload {
    AutomatedEndpointTest(AutomatedPayload),
    ManualPromptTest(ManualPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomatedPayload {
    pub endpoint: EndpointConfig,
    /// Work items derived from the shared prompt set, fixed before fan-out.
    #[serde(default)]
    pub items: Vec<WorkItem>,
    /// Phase-1 per-item results, keyed by stringified item index.
    #[serde(default)]
    pub collected: BTreeMap<String, ItemResult<CollectedResponse>>,
    /// Phase-2 per-item results, keyed by stringified item index.
    #[serde(default)]
    pub evaluated: BTreeMap<String, ItemResult<EvaluationScoreBundle>>,
    /// Written once at finalization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<JobSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualPayload {
    pub pairs: Vec<PromptResponsePair>,
    #[serde(default)]
    pub evaluated: BTreeMap<String, ItemResult<EvaluationScoreBundle>>,
    /// Written once at finalization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<JobSummary>,
}

impl JobPayload {
    pub fn evaluated(&self) -> &BTreeMap<String, ItemResult<EvaluationScoreBundle>> {
        match self {
            JobPayload::AutomatedEndpointTest(p) => &p.evaluated,
            JobPayload::ManualPromptTest(p) => &p.evaluated,
        }
    }
}

/// An evaluation job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalJob {
    pub id: Uuid,
    /// External correlation key, unique across jobs.
    pub job_id: String,
    pub user_id: String,
    pub project_id: Uuid,
    pub job_type: JobType,
    pub status: JobStatus,
    pub total_items: i32,
    pub payload: JobPayload,
    pub progress: String,
    pub percent: i32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_round_trips_through_strings() {
        for status in [
            JobStatus::CollectingResponses,
            JobStatus::Evaluating,
            JobStatus::Success,
            JobStatus::PartialSuccess,
            JobStatus::Failed,
        ] {
            let s = status.to_string();
            assert_eq!(s.parse::<JobStatus>().unwrap(), status);
        }
        assert_eq!(JobStatus::PartialSuccess.to_string(), "partial_success");
    }

    #[test]
    fn payload_tagging_keeps_item_maps_addressable() {
        let payload = JobPayload::ManualPromptTest(ManualPayload {
            pairs: vec![PromptResponsePair {
                category: "gender".into(),
                prompt_text: "Describe a nurse.".into(),
                response_text: "A nurse cares for patients.".into(),
            }],
            evaluated: BTreeMap::new(),
            summary: None,
        });

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["job_type"], "manual_prompt_test");
        // The evaluated map must live at a stable top-level path so the
        // store can merge individual slots with jsonb_set.
        assert!(json.get("evaluated").unwrap().is_object());
    }

    #[test]
    fn item_result_serializes_tagged() {
        let ok: ItemResult<CollectedResponse> = ItemResult::Ok {
            value: CollectedResponse {
                answer: "hi".into(),
            },
        };
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["outcome"], "ok");
        assert_eq!(json["value"]["answer"], "hi");

        let err: ItemResult<CollectedResponse> = ItemResult::Err {
            error: "boom".into(),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["outcome"], "err");
        assert!(err.error().is_some());
    }
}
