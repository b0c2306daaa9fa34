//! Evaluator Backend Adapter
//!
//! Runs the primary LLM judge and the secondary fairness service for one
//! response, collapses their outputs into blended scores and verdicts,
//! and produces the persisted [`EvaluationScoreBundle`].

use uuid::Uuid;

use crate::models::evaluation::{EvaluationScoreBundle, MetricReasoning};
use crate::services::blend;
use crate::services::fairness::{FairnessHandle, FairnessSignals};
use crate::services::judge::{JudgeHandle, JudgeResult};

#[derive(Debug, thiserror::Error)]
pub enum EvaluateError {
    #[error("response text is empty")]
    EmptyResponse,
}

pub struct Evaluator {
    judge: JudgeHandle,
    fairness: FairnessHandle,
}

impl Evaluator {
    pub fn new(judge: JudgeHandle, fairness: FairnessHandle) -> Self {
        Self { judge, fairness }
    }

    /// Evaluate one response against all metrics. The two backends run
    /// concurrently; neither failing aborts the item (degraded/null paths
    /// run through blending instead).
    pub async fn evaluate(
        &self,
        project_id: Uuid,
        category: &str,
        prompt: &str,
        response: &str,
    ) -> Result<EvaluationScoreBundle, EvaluateError> {
        if response.trim().is_empty() {
            return Err(EvaluateError::EmptyResponse);
        }

        let (judge_result, signals) = tokio::join!(
            self.judge.evaluate(category, prompt, response),
            self.fairness.evaluate(project_id, category, prompt, response),
        );

        Ok(compose_bundle(judge_result, signals))
    }
}

/// Blend judge and fairness outputs into the final bundle.
///
/// A degraded judge is discounted: its neutral constant is dropped from
/// bias/toxicity blending whenever the secondary service produced a real
/// signal, and only fills the slot when no other source exists. Scores
/// are rounded to 3 decimal places here, at the output boundary.
pub(crate) fn compose_bundle(
    judge_result: JudgeResult,
    signals: FairnessSignals,
) -> EvaluationScoreBundle {
    let (judge_scores, degraded, degraded_reason) = match judge_result {
        JudgeResult::Scored(scores) => (Some(scores), false, None),
        JudgeResult::Degraded { reason } => (None, true, Some(reason)),
    };

    let judge_bias = judge_scores.as_ref().map(|s| s.bias);
    let judge_toxicity = judge_scores.as_ref().map(|s| s.toxicity);

    let mut bias = blend::blend_bias(judge_bias, signals.stereotype);
    let mut toxicity = blend::blend_toxicity(judge_toxicity, signals.toxicity);
    let mut relevancy = judge_scores.as_ref().map(|s| s.relevancy);
    let mut faithfulness = judge_scores.as_ref().map(|s| s.faithfulness);

    if degraded {
        // Exhausted providers score neutral, never null: a null here would
        // read downstream as "no issue detected".
        bias = bias.or(Some(blend::NEUTRAL_SCORE));
        toxicity = toxicity.or(Some(blend::NEUTRAL_SCORE));
        relevancy = relevancy.or(Some(blend::NEUTRAL_SCORE));
        faithfulness = faithfulness.or(Some(blend::NEUTRAL_SCORE));
    }

    let overall = blend::overall_score(bias, toxicity, relevancy, faithfulness);

    let bias = bias.map(blend::round3);
    let toxicity = toxicity.map(blend::round3);
    let relevancy = relevancy.map(blend::round3);
    let faithfulness = faithfulness.map(blend::round3);
    let overall = overall.map(blend::round3);

    let reasoning = match (&judge_scores, &degraded_reason) {
        (Some(scores), _) => {
            let mut reasoning = scores.reasoning.clone();
            if let Some(service_reason) = &signals.reason {
                // Surface why the secondary signal is missing alongside the
                // judge's own toxicity reasoning.
                reasoning.toxicity = Some(match reasoning.toxicity.take() {
                    Some(existing) => format!("{existing} (fairness service: {service_reason})"),
                    None => format!("fairness service: {service_reason}"),
                });
            }
            reasoning
        }
        (None, Some(reason)) => MetricReasoning {
            bias: Some(reason.clone()),
            toxicity: Some(reason.clone()),
            relevancy: Some(reason.clone()),
            faithfulness: Some(reason.clone()),
        },
        (None, None) => MetricReasoning::default(),
    };

    EvaluationScoreBundle {
        bias,
        toxicity,
        relevancy,
        faithfulness,
        overall_score: overall,
        verdicts: blend::verdicts(bias, toxicity, relevancy, faithfulness, overall),
        reasoning,
        degraded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::judge::JudgeScores;

    fn scored(bias: f64, toxicity: f64, relevancy: f64, faithfulness: f64) -> JudgeResult {
        JudgeResult::Scored(JudgeScores {
            bias,
            toxicity,
            relevancy,
            faithfulness,
            reasoning: MetricReasoning::default(),
        })
    }

    #[test]
    fn test_compose_with_both_sources() {
        let signals = FairnessSignals {
            toxicity: Some(0.8),
            stereotype: Some(0.5),
            reason: None,
        };
        let bundle = compose_bundle(scored(0.2, 0.1, 0.9, 0.8), signals);

        // stereotype 0.5 > 0.3 threshold: elevated weight 0.4
        assert_eq!(bundle.bias, Some(blend::round3(0.2 * 0.6 + 0.5 * 0.4)));
        assert_eq!(bundle.toxicity, Some(blend::round3(0.1 * 0.3 + 0.8 * 0.7)));
        assert_eq!(bundle.relevancy, Some(0.9));
        assert!(!bundle.degraded);
        assert!(bundle.overall_score.is_some());
    }

    #[test]
    fn test_degraded_judge_discounted_when_secondary_present() {
        let signals = FairnessSignals {
            toxicity: Some(0.9),
            stereotype: Some(0.6),
            reason: None,
        };
        let bundle = compose_bundle(
            JudgeResult::Degraded {
                reason: "all models exhausted".into(),
            },
            signals,
        );

        // Secondary signals used alone, not averaged with the neutral 0.5.
        assert_eq!(bundle.bias, Some(0.6));
        assert_eq!(bundle.toxicity, Some(0.9));
        // No secondary source for these: neutral constant.
        assert_eq!(bundle.relevancy, Some(0.5));
        assert_eq!(bundle.faithfulness, Some(0.5));
        assert!(bundle.degraded);
        assert_eq!(bundle.reasoning.bias.as_deref(), Some("all models exhausted"));
    }

    #[test]
    fn test_degraded_with_no_secondary_is_neutral_not_null() {
        let bundle = compose_bundle(
            JudgeResult::Degraded {
                reason: "unconfigured".into(),
            },
            FairnessSignals::default(),
        );
        assert_eq!(bundle.bias, Some(0.5));
        assert_eq!(bundle.toxicity, Some(0.5));
        assert_eq!(bundle.overall_score, Some(0.5));
        assert!(bundle.degraded);
        assert_eq!(bundle.verdicts.bias, "Moderate Bias");
    }

    #[test]
    fn test_judge_only_when_secondary_unavailable() {
        let signals = FairnessSignals {
            toxicity: None,
            stereotype: None,
            reason: Some("timed out".into()),
        };
        let bundle = compose_bundle(scored(0.1, 0.2, 0.9, 0.7), signals);
        assert_eq!(bundle.bias, Some(0.1));
        assert_eq!(bundle.toxicity, Some(0.2));
        assert!(bundle
            .reasoning
            .toxicity
            .as_deref()
            .unwrap()
            .contains("timed out"));
    }

    #[test]
    fn test_scores_rounded_at_boundary() {
        let signals = FairnessSignals {
            toxicity: Some(1.0 / 3.0),
            stereotype: None,
            reason: None,
        };
        let bundle = compose_bundle(scored(1.0 / 3.0, 1.0 / 3.0, 2.0 / 3.0, 2.0 / 3.0), signals);
        for score in [
            bundle.bias,
            bundle.toxicity,
            bundle.relevancy,
            bundle.faithfulness,
            bundle.overall_score,
        ] {
            let s = score.unwrap();
            assert_eq!(s, blend::round3(s), "score {s} not rounded");
        }
    }
}
