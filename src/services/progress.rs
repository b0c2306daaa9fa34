//! Progress Aggregator
//!
//! Pure slot-merge logic for per-item completion events. Percent and
//! progress are derived from the count of populated slots, never from
//! arrival order, so they are monotonic within a phase under any delivery
//! permutation. Duplicate deliveries are detected by a presence check
//! before any mutation; phase transitions fire only on the arrival that
//! newly populates the final slot.

use std::collections::BTreeMap;

use crate::models::evaluation::EvaluationScoreBundle;
use crate::models::job::{
    AutomatedPayload, CollectedResponse, ItemResult, JobStatus, WorkItem,
};

/// Result of merging one completion event into the job's per-item state.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    /// False when the slot was already populated (duplicate delivery);
    /// the rest of the outcome then reflects the previously recorded
    /// state, unchanged.
    pub newly_recorded: bool,
    pub completed: usize,
    pub phase_total: usize,
    pub phase_complete: bool,
    pub percent: i32,
    pub progress: String,
    /// Forward status transition to apply, present only on the single
    /// arrival that crosses the phase threshold.
    pub status_change: Option<JobStatus>,
}

/// Single-phase model: evaluated/total mapped onto 0-100.
pub fn single_phase_percent(completed: usize, total: usize) -> i32 {
    if total == 0 {
        return 0;
    }
    let percent = (completed as f64 / total as f64 * 100.0).round() as i32;
    percent.clamp(0, 100)
}

/// Two-phase model, phase 1: collected/total mapped onto 0-50.
pub fn collection_percent(completed: usize, total: usize) -> i32 {
    if total == 0 {
        return 0;
    }
    let percent = (completed as f64 / total as f64 * 50.0).round() as i32;
    percent.clamp(0, 50)
}

/// Two-phase model, phase 2: evaluated/phase_total mapped onto 50-100.
pub fn evaluation_percent(completed: usize, phase_total: usize) -> i32 {
    if phase_total == 0 {
        return 50;
    }
    let percent = 50 + (completed as f64 / phase_total as f64 * 50.0).round() as i32;
    percent.clamp(50, 100)
}

/// Merge one collection-phase completion into an automated payload.
///
/// On the arrival that completes the phase: all items failed forces the
/// job to `failed`, locked at 50 percent; otherwise the job advances to
/// `evaluating`.
pub fn record_collection(
    payload: &mut AutomatedPayload,
    total: usize,
    index: u32,
    result: ItemResult<CollectedResponse>,
) -> MergeOutcome {
    let key = index.to_string();

    if payload.collected.contains_key(&key) {
        let completed = payload.collected.len();
        return MergeOutcome {
            newly_recorded: false,
            completed,
            phase_total: total,
            phase_complete: completed >= total,
            percent: collection_percent(completed, total),
            progress: format!("{completed}/{total}"),
            status_change: None,
        };
    }

    payload.collected.insert(key, result);
    let completed = payload.collected.len();
    let phase_complete = completed >= total;

    let status_change = if phase_complete {
        if payload.collected.values().all(|r| !r.is_ok()) {
            Some(JobStatus::Failed)
        } else {
            Some(JobStatus::Evaluating)
        }
    } else {
        None
    };

    MergeOutcome {
        newly_recorded: true,
        completed,
        phase_total: total,
        phase_complete,
        percent: collection_percent(completed, total),
        progress: format!("{completed}/{total}"),
        status_change,
    }
}

/// Merge one evaluation-phase completion into the evaluated map.
/// `phase_total` is the number of evaluation dispatches for this job
/// (successfully collected items for automated jobs, all pairs for
/// manual ones).
pub fn record_evaluation(
    evaluated: &mut BTreeMap<String, ItemResult<EvaluationScoreBundle>>,
    phase_total: usize,
    two_phase: bool,
    index: u32,
    result: ItemResult<EvaluationScoreBundle>,
) -> MergeOutcome {
    let key = index.to_string();
    let percent_of = |completed: usize| {
        if two_phase {
            evaluation_percent(completed, phase_total)
        } else {
            single_phase_percent(completed, phase_total)
        }
    };

    if evaluated.contains_key(&key) {
        let completed = evaluated.len();
        return MergeOutcome {
            newly_recorded: false,
            completed,
            phase_total,
            phase_complete: completed >= phase_total,
            percent: percent_of(completed),
            progress: format!("{completed}/{phase_total}"),
            status_change: None,
        };
    }

    evaluated.insert(key, result);
    let completed = evaluated.len();

    MergeOutcome {
        newly_recorded: true,
        completed,
        phase_total,
        phase_complete: completed >= phase_total,
        percent: percent_of(completed),
        progress: format!("{completed}/{phase_total}"),
        status_change: None,
    }
}

/// Work items whose endpoint call succeeded, re-sorted by original item
/// index so phase-2 dispatch order is independent of phase-1 completion
/// order.
pub fn successful_collection_items(payload: &AutomatedPayload) -> Vec<WorkItem> {
    let mut indices: Vec<u32> = payload
        .collected
        .iter()
        .filter(|(_, result)| result.is_ok())
        .filter_map(|(key, _)| key.parse().ok())
        .collect();
    indices.sort_unstable();

    indices
        .into_iter()
        .filter_map(|idx| payload.items.iter().find(|item| item.index == idx))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::EndpointConfig;

    fn automated(total: u32) -> AutomatedPayload {
        AutomatedPayload {
            endpoint: EndpointConfig {
                url: "https://api.example.com/chat".into(),
                request_template: r#"{"prompt": "{{PROMPT}}"}"#.into(),
                response_path: "answer".into(),
                api_key: None,
                key_placement: Default::default(),
                key_field: None,
            },
            items: (0..total)
                .map(|i| WorkItem {
                    index: i,
                    category: "gender".into(),
                    prompt_text: format!("prompt {i}"),
                })
                .collect(),
            collected: BTreeMap::new(),
            evaluated: BTreeMap::new(),
            summary: None,
        }
    }

    fn ok_response(i: u32) -> ItemResult<CollectedResponse> {
        ItemResult::Ok {
            value: CollectedResponse {
                answer: format!("answer {i}"),
            },
        }
    }

    fn err_response() -> ItemResult<CollectedResponse> {
        ItemResult::Err {
            error: "endpoint returned HTTP 500".into(),
        }
    }

    fn bundle() -> ItemResult<EvaluationScoreBundle> {
        ItemResult::Ok {
            value: EvaluationScoreBundle {
                bias: Some(0.1),
                toxicity: Some(0.1),
                relevancy: Some(0.9),
                faithfulness: Some(0.9),
                overall_score: Some(0.9),
                verdicts: crate::services::blend::verdicts(
                    Some(0.1),
                    Some(0.1),
                    Some(0.9),
                    Some(0.9),
                    Some(0.9),
                ),
                reasoning: Default::default(),
                degraded: false,
            },
        }
    }

    #[test]
    fn test_single_phase_reaches_100_in_any_permutation_with_duplicates() {
        // Delivery order 2,0,2,1,0: duplicates interleaved.
        let mut evaluated = BTreeMap::new();
        let deliveries = [2u32, 0, 2, 1, 0];
        let mut last = None;
        for idx in deliveries {
            last = Some(record_evaluation(&mut evaluated, 3, false, idx, bundle()));
        }
        let outcome = last.unwrap();
        assert_eq!(outcome.percent, 100);
        assert_eq!(outcome.progress, "3/3");
        assert!(outcome.phase_complete);
    }

    #[test]
    fn test_duplicate_delivery_is_idempotent() {
        let mut evaluated = BTreeMap::new();
        let first = record_evaluation(&mut evaluated, 3, false, 1, bundle());
        let snapshot = serde_json::to_value(&evaluated).unwrap();
        let second = record_evaluation(&mut evaluated, 3, false, 1, bundle());

        assert!(first.newly_recorded);
        assert!(!second.newly_recorded);
        assert_eq!(first.completed, second.completed);
        assert_eq!(first.percent, second.percent);
        assert_eq!(serde_json::to_value(&evaluated).unwrap(), snapshot);
    }

    #[test]
    fn test_percent_monotonic_within_phase() {
        let mut evaluated = BTreeMap::new();
        let mut previous = 0;
        for idx in [4u32, 1, 3, 1, 0, 2] {
            let outcome = record_evaluation(&mut evaluated, 5, false, idx, bundle());
            assert!(outcome.percent >= previous, "percent regressed");
            previous = outcome.percent;
        }
        assert_eq!(previous, 100);
    }

    #[test]
    fn test_collection_maps_onto_lower_half() {
        let mut payload = automated(4);
        let outcome = record_collection(&mut payload, 4, 0, ok_response(0));
        assert_eq!(outcome.percent, 13); // round(1/4 * 50)
        let outcome = record_collection(&mut payload, 4, 1, ok_response(1));
        assert_eq!(outcome.percent, 25);
        assert!(outcome.status_change.is_none());
    }

    #[test]
    fn test_collection_completion_transitions_to_evaluating() {
        let mut payload = automated(2);
        record_collection(&mut payload, 2, 0, ok_response(0));
        let outcome = record_collection(&mut payload, 2, 1, err_response());
        assert!(outcome.phase_complete);
        assert_eq!(outcome.percent, 50);
        assert_eq!(outcome.status_change, Some(JobStatus::Evaluating));
    }

    #[test]
    fn test_all_failed_collection_forces_failed_at_50() {
        let mut payload = automated(2);
        record_collection(&mut payload, 2, 0, err_response());
        let outcome = record_collection(&mut payload, 2, 1, err_response());
        assert_eq!(outcome.status_change, Some(JobStatus::Failed));
        assert_eq!(outcome.percent, 50);
    }

    #[test]
    fn test_transition_fires_exactly_once_under_duplicate_threshold_crossing() {
        let mut payload = automated(2);
        record_collection(&mut payload, 2, 0, ok_response(0));
        let crossing = record_collection(&mut payload, 2, 1, ok_response(1));
        let duplicate = record_collection(&mut payload, 2, 1, ok_response(1));

        assert_eq!(crossing.status_change, Some(JobStatus::Evaluating));
        assert!(crossing.newly_recorded && crossing.phase_complete);
        // The racing duplicate sees the phase complete but must not
        // re-trigger the transition.
        assert!(duplicate.phase_complete);
        assert!(!duplicate.newly_recorded);
        assert!(duplicate.status_change.is_none());
    }

    #[test]
    fn test_evaluation_percent_upper_half() {
        let mut evaluated = BTreeMap::new();
        let outcome = record_evaluation(&mut evaluated, 2, true, 0, bundle());
        assert_eq!(outcome.percent, 75);
        let outcome = record_evaluation(&mut evaluated, 2, true, 1, bundle());
        assert_eq!(outcome.percent, 100);
    }

    #[test]
    fn test_successful_items_sorted_by_original_index() {
        let mut payload = automated(12);
        // Completion order deliberately scrambled; index 10 before 2
        // exercises numeric (not lexicographic) ordering.
        for idx in [10u32, 2, 7, 0] {
            record_collection(&mut payload, 12, idx, ok_response(idx));
        }
        record_collection(&mut payload, 12, 5, err_response());

        let items = successful_collection_items(&payload);
        let indices: Vec<u32> = items.iter().map(|i| i.index).collect();
        assert_eq!(indices, vec![0, 2, 7, 10]);
    }

    #[test]
    fn test_zero_total_percent_is_clamped() {
        assert_eq!(single_phase_percent(0, 0), 0);
        assert_eq!(collection_percent(0, 0), 0);
        assert_eq!(evaluation_percent(0, 0), 50);
    }
}
