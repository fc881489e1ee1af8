use std::collections::BTreeMap;
use std::sync::Arc;

use crate::engine::{IterationFailure, RunResult, SlotReviewOutcome};
use crate::providers::{PreviewEntry, PreviewKind, Provider};
use crate::tracker::{classify, Task};

pub struct AggregateInput<'a> {
    pub provider: &'a Arc<dyn Provider>,
    pub results: &'a [RunResult],
    /// The snapshot's remaining-issue index; the pick fallback is scoped to
    /// it so closed tasks cannot surface as picks.
    pub remaining: &'a BTreeMap<String, Task>,
    pub picked_by_agent: BTreeMap<u16, String>,
    pub review_outcomes: &'a BTreeMap<u16, SlotReviewOutcome>,
    pub preview_lines: usize,
}

#[derive(Debug, Default)]
pub struct AggregatedIteration {
    pub picked_by_agent: BTreeMap<u16, String>,
    pub usage: crate::providers::UsageSummary,
    pub failed: Vec<IterationFailure>,
    pub stop_detected: bool,
}

/// Fold slot results into the iteration-level view the loop controller acts
/// on: usage totals, the failure list, pick completion, and stop detection.
pub fn aggregate(input: AggregateInput<'_>) -> AggregatedIteration {
    let mut out = AggregatedIteration {
        picked_by_agent: input.picked_by_agent,
        ..AggregatedIteration::default()
    };

    for run in input.results {
        let combined = run.result.combined_output();

        if run.result.status != Some(0) {
            out.failed.push(IterationFailure {
                agent_id: run.agent_id,
                status: run.result.status,
                combined_output: combined.clone(),
                raw_tail: input
                    .provider
                    .collect_raw_json_lines(&combined, input.preview_lines),
            });
        }

        if let Some(usage) = input.provider.extract_usage_summary(&combined) {
            out.usage.add(&usage);
        }

        let last_message = std::fs::read_to_string(&run.last_message_path).unwrap_or_default();
        let preview = input.provider.collect_messages(&combined);
        out.stop_detected |= should_stop(input.provider.as_ref(), &preview, &last_message);

        if !out.picked_by_agent.contains_key(&run.agent_id) {
            if let Some(task_id) = classify::extract_referenced_task_ids(&combined, input.remaining)
                .into_iter()
                .next()
            {
                out.picked_by_agent.insert(run.agent_id, task_id);
            }
        }

        if let Some(outcome) = input.review_outcomes.get(&run.agent_id) {
            if !outcome.passed {
                let reason = outcome
                    .failure_reason
                    .as_deref()
                    .unwrap_or("review did not pass");
                out.failed.push(IterationFailure {
                    agent_id: run.agent_id,
                    status: None,
                    combined_output: format!(
                        "review failed for agent {}: {reason}",
                        run.agent_id
                    ),
                    raw_tail: Vec::new(),
                });
            }
        }
    }

    out
}

/// True iff the last message carries the stop marker, or any assistant- or
/// message-kind preview entry does. Tool and reasoning entries are ignored.
pub fn should_stop(provider: &dyn Provider, preview: &[PreviewEntry], last_message: &str) -> bool {
    if provider.has_stop_marker(last_message) {
        return true;
    }
    preview.iter().any(|entry| {
        matches!(entry.kind, PreviewKind::Assistant | PreviewKind::Message)
            && provider.has_stop_marker(&entry.text)
    })
}
