//! Secondary statistical fairness service client
//!
//! One POST per evaluated response, batched as a one-element list, with a
//! hard timeout enforced by cancellation. Never retried: the service runs
//! heavyweight classifiers and backoff at this layer would blow the job
//! latency budget. Failures and timeouts yield null-scored signals with a
//! reason string so blending can fall back to the judge alone.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Signals extracted from the fairness service for one response. Each
/// sub-metric group is collapsed to its strongest indicator.
#[derive(Debug, Clone, Default)]
pub struct FairnessSignals {
    pub toxicity: Option<f64>,
    pub stereotype: Option<f64>,
    pub reason: Option<String>,
}

impl FairnessSignals {
    fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            toxicity: None,
            stereotype: None,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EvaluateItem<'a> {
    project_id: Uuid,
    category: &'a str,
    question_text: &'a str,
    user_response: &'a str,
}

#[derive(Serialize)]
struct EvaluateRequest<'a> {
    items: Vec<EvaluateItem<'a>>,
}

#[derive(Deserialize)]
struct EvaluateEnvelope {
    success: bool,
    #[serde(default)]
    results: Vec<EvaluateResult>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct EvaluateResult {
    success: bool,
    #[serde(default)]
    metrics: Option<FairnessMetrics>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FairnessMetrics {
    #[serde(default)]
    pub toxicity: ToxicityMetrics,
    #[serde(default)]
    pub stereotype: StereotypeMetrics,
}

#[derive(Debug, Default, Deserialize)]
pub struct ToxicityMetrics {
    #[serde(default)]
    pub toxic_fraction: Option<f64>,
    #[serde(default)]
    pub expected_max_toxicity: Option<f64>,
    #[serde(default)]
    pub toxicity_probability: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StereotypeMetrics {
    #[serde(default)]
    pub stereotype_association: Option<f64>,
    #[serde(default)]
    pub cooccurrence_bias: Option<f64>,
    #[serde(default)]
    pub stereotype_fraction: Option<f64>,
}

/// Fairness service capability handle; absence of a configured URL is an
/// explicit variant.
pub enum FairnessHandle {
    Ready(FairnessClient),
    Unconfigured,
}

impl FairnessHandle {
    pub fn from_config(service_url: Option<String>, timeout: Duration) -> Self {
        match service_url {
            Some(url) if !url.is_empty() => FairnessHandle::Ready(FairnessClient {
                http: reqwest::Client::new(),
                service_url: url,
                timeout,
            }),
            _ => FairnessHandle::Unconfigured,
        }
    }

    /// Evaluate one response. Never errors; unavailability produces
    /// null-scored signals with a reason.
    pub async fn evaluate(
        &self,
        project_id: Uuid,
        category: &str,
        question_text: &str,
        user_response: &str,
    ) -> FairnessSignals {
        match self {
            FairnessHandle::Ready(client) => {
                client
                    .evaluate(project_id, category, question_text, user_response)
                    .await
            }
            FairnessHandle::Unconfigured => {
                FairnessSignals::unavailable("fairness service is not configured")
            }
        }
    }
}

pub struct FairnessClient {
    http: reqwest::Client,
    service_url: String,
    timeout: Duration,
}

impl FairnessClient {
    async fn evaluate(
        &self,
        project_id: Uuid,
        category: &str,
        question_text: &str,
        user_response: &str,
    ) -> FairnessSignals {
        let request = EvaluateRequest {
            items: vec![EvaluateItem {
                project_id,
                category: normalize_category(category),
                question_text,
                user_response,
            }],
        };

        let url = format!("{}/evaluate", self.service_url.trim_end_matches('/'));
        let call = async {
            self.http
                .post(&url)
                .json(&request)
                .send()
                .await?
                .error_for_status()?
                .json::<EvaluateEnvelope>()
                .await
        };

        // Hard timeout via cancellation; the in-flight request is dropped.
        let envelope = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(envelope)) => envelope,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Fairness service call failed");
                return FairnessSignals::unavailable(format!("fairness service error: {e}"));
            }
            Err(_) => {
                tracing::warn!(timeout_secs = self.timeout.as_secs(), "Fairness service call timed out");
                return FairnessSignals::unavailable(format!(
                    "fairness service timed out after {:?}",
                    self.timeout
                ));
            }
        };

        signals_from_envelope(envelope)
    }
}

/// Collapse the service envelope into blendable signals.
fn signals_from_envelope(envelope: EvaluateEnvelope) -> FairnessSignals {
    if !envelope.success {
        let reason = envelope
            .error
            .unwrap_or_else(|| "fairness service reported failure".to_string());
        return FairnessSignals::unavailable(reason);
    }

    let Some(result) = envelope.results.into_iter().next() else {
        return FairnessSignals::unavailable("fairness service returned no results");
    };

    if !result.success {
        let reason = result
            .error
            .unwrap_or_else(|| "fairness evaluation failed".to_string());
        return FairnessSignals::unavailable(reason);
    }

    let Some(metrics) = result.metrics else {
        return FairnessSignals::unavailable("fairness service returned no metrics");
    };

    FairnessSignals {
        toxicity: max_of(&[
            metrics.toxicity.toxic_fraction,
            metrics.toxicity.expected_max_toxicity,
            metrics.toxicity.toxicity_probability,
        ]),
        stereotype: max_of(&[
            metrics.stereotype.stereotype_association,
            metrics.stereotype.cooccurrence_bias,
            metrics.stereotype.stereotype_fraction,
        ]),
        reason: None,
    }
}

fn max_of(values: &[Option<f64>]) -> Option<f64> {
    values
        .iter()
        .filter_map(|v| *v)
        .fold(None, |acc, v| Some(acc.map_or(v, |a: f64| a.max(v))))
}

/// Map request categories onto the ones the fairness service understands:
/// ethnicity folds into race, anything unknown defaults to gender.
pub fn normalize_category(category: &str) -> &'static str {
    match category.to_ascii_lowercase().as_str() {
        "gender" => "gender",
        "race" | "ethnicity" => "race",
        "religion" => "religion",
        "age" => "age",
        _ => "gender",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(json: &str) -> EvaluateEnvelope {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_signals_take_strongest_sub_metric() {
        let signals = signals_from_envelope(envelope(
            r#"{
                "success": true,
                "results": [{
                    "success": true,
                    "metrics": {
                        "toxicity": {
                            "toxic_fraction": 0.0,
                            "expected_max_toxicity": 0.62,
                            "toxicity_probability": 0.31
                        },
                        "stereotype": {
                            "stereotype_association": 0.12,
                            "cooccurrence_bias": 0.4,
                            "stereotype_fraction": 0.0
                        }
                    }
                }]
            }"#,
        ));
        assert_eq!(signals.toxicity, Some(0.62));
        assert_eq!(signals.stereotype, Some(0.4));
        assert!(signals.reason.is_none());
    }

    #[test]
    fn test_failure_envelope_yields_null_signals_with_reason() {
        let signals = signals_from_envelope(envelope(
            r#"{"success": false, "error": "model load failed"}"#,
        ));
        assert_eq!(signals.toxicity, None);
        assert_eq!(signals.stereotype, None);
        assert_eq!(signals.reason.as_deref(), Some("model load failed"));
    }

    #[test]
    fn test_failed_item_yields_null_signals() {
        let signals = signals_from_envelope(envelope(
            r#"{"success": true, "results": [{"success": false, "error": "empty response"}]}"#,
        ));
        assert!(signals.toxicity.is_none());
        assert_eq!(signals.reason.as_deref(), Some("empty response"));
    }

    #[test]
    fn test_missing_sub_metrics_are_skipped() {
        let signals = signals_from_envelope(envelope(
            r#"{
                "success": true,
                "results": [{
                    "success": true,
                    "metrics": {"toxicity": {"toxic_fraction": 0.1}, "stereotype": {}}
                }]
            }"#,
        ));
        assert_eq!(signals.toxicity, Some(0.1));
        assert_eq!(signals.stereotype, None);
    }

    #[test]
    fn test_normalize_category() {
        assert_eq!(normalize_category("Gender"), "gender");
        assert_eq!(normalize_category("ethnicity"), "race");
        assert_eq!(normalize_category("RACE"), "race");
        assert_eq!(normalize_category("nationality"), "gender");
    }

    #[test]
    fn test_unconfigured_handle_returns_reason() {
        let handle = FairnessHandle::from_config(None, Duration::from_secs(20));
        let signals =
            tokio_test::block_on(handle.evaluate(Uuid::new_v4(), "gender", "q", "r"));
        assert!(signals.toxicity.is_none());
        assert!(signals.reason.is_some());
    }
}
