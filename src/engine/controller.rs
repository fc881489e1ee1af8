use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;

use crate::config::{BeadMode, CliOptions};
use crate::engine::aggregate::{aggregate, AggregateInput, AggregatedIteration};
use crate::engine::gate::StagedLaunchGate;
use crate::engine::lock::RunLock;
use crate::engine::paths::iteration_stamp;
use crate::engine::shutdown::ShutdownGuard;
use crate::engine::slot::{run_slot, IterationContext};
use crate::engine::state::{self, IterationState};
use crate::engine::{IterationFailure, RunResult, SlotReviewOutcome};
use crate::fsutil;
use crate::providers::{Provider, UsageSummary, STOP_MARKER};
use crate::render::{LoopPhase, Reporter, Tone};
use crate::tracker::{snapshot::load_snapshot, Task, TaskSnapshot};

pub struct RunContext {
    pub project_root: PathBuf,
    pub options: Arc<CliOptions>,
    pub implementer: Arc<dyn Provider>,
    pub reviewer: Arc<dyn Provider>,
    pub guard: ShutdownGuard,
    pub reporter: Arc<dyn Reporter>,
}

/// The outer loop: snapshot, iterate, aggregate, decide.
pub async fn run_loop(ctx: RunContext) -> Result<()> {
    let options = ctx.options.clone();
    let meta_dir = fsutil::project_meta_dir(&ctx.project_root);
    let state_path = state::state_path(&ctx.project_root);
    let mut state =
        state::load_or_init(&state_path, options.iteration_limit, options.iterations_set)?;

    if state.circuit_broken() {
        ctx.reporter.set_loop_notice(
            Tone::Warn,
            &format!(
                "iteration circuit breaker engaged ({}/{}); reset {} to continue",
                state.current_iteration,
                state.max_iterations,
                state_path.display()
            ),
        );
        return Ok(());
    }

    let _lock = RunLock::acquire(&meta_dir)?;

    let run_dir = options
        .log_dir
        .join(format!("run-{}", iteration_stamp(Utc::now())));
    fsutil::ensure_dir(&run_dir)?;
    let journal = run_dir.join("journal.md");
    ctx.reporter.set_run_context(&run_dir, ctx.implementer.name());
    append_journal(
        &journal,
        "run boot",
        &format!(
            "Starting at iteration {}/{} in {}.",
            state.current_iteration,
            state.max_iterations,
            ctx.project_root.display()
        ),
    )?;

    let reviewer_prompt = match (&options.reviewer_prompt_path, options.review_enabled) {
        (Some(path), true) => Some(Arc::new(fsutil::read_to_string(path)?)),
        _ => None,
    };

    let mut run_usage = UsageSummary::default();

    while state.current_iteration < state.max_iterations && !ctx.guard.is_shutting_down() {
        let snapshot = match options.bead_mode {
            BeadMode::TopLevel => {
                let top_level = options
                    .top_level_task_id
                    .as_deref()
                    .ok_or_else(|| anyhow!("bead-mode top-level requires a top-level task id"))?;
                let snapshot = load_snapshot(&ctx.project_root, Some(top_level)).await;
                if snapshot.available && snapshot.remaining == 0 {
                    ctx.reporter.set_loop_notice(
                        Tone::Success,
                        &format!("all tasks under {top_level} are closed"),
                    );
                    append_journal(&journal, "run completed", "Top-level scope exhausted.")?;
                    return Ok(());
                }
                snapshot
            }
            BeadMode::Auto => load_snapshot(&ctx.project_root, None).await,
        };
        ctx.reporter.set_tasks_snapshot(&snapshot);

        let mut prompt = fsutil::read_to_string(&options.developer_prompt_path)?;
        if options.bead_mode == BeadMode::TopLevel {
            if let Some(top_level) = options.top_level_task_id.as_deref() {
                prompt.push_str(&scope_guidance(top_level));
            }
        }

        state.current_iteration += 1;
        state::persist(&state_path, &state)?;
        ctx.reporter
            .set_iteration(state.current_iteration, state.max_iterations);
        ctx.reporter.set_loop_phase(LoopPhase::Starting);

        let snapshot = Arc::new(snapshot);
        let remaining = Arc::new(remaining_index(&snapshot));
        let iteration_ctx = Arc::new(IterationContext {
            iteration: state.current_iteration,
            stamp: iteration_stamp(Utc::now()),
            run_dir: run_dir.clone(),
            project_root: ctx.project_root.clone(),
            options: options.clone(),
            implementer: ctx.implementer.clone(),
            reviewer: ctx.reviewer.clone(),
            snapshot: snapshot.clone(),
            remaining: remaining.clone(),
            prompt: Arc::new(prompt),
            reviewer_prompt: reviewer_prompt.clone(),
            gate: Arc::new(StagedLaunchGate::new()),
            guard: ctx.guard.clone(),
            reporter: ctx.reporter.clone(),
        });

        let (results, picks, review_outcomes) = run_iteration(iteration_ctx).await?;

        ctx.reporter.set_loop_phase(LoopPhase::Collecting);
        let agg = aggregate(AggregateInput {
            provider: &ctx.implementer,
            results: &results,
            remaining: &remaining,
            picked_by_agent: picks,
            review_outcomes: &review_outcomes,
            preview_lines: options.preview_lines,
        });
        run_usage.add(&agg.usage);
        journal_iteration(&journal, &state, &agg)?;

        if !agg.failed.is_empty() {
            let retry = retry_wait_seconds(ctx.implementer.as_ref(), &agg.failed);
            match retry {
                Some(wait) if state.current_iteration < state.max_iterations => {
                    ctx.reporter.set_loop_notice(
                        Tone::Warn,
                        &format!(
                            "{} agent(s) throttled; retrying in {wait}s",
                            agg.failed.len()
                        ),
                    );
                    retry_countdown(ctx.reporter.as_ref(), wait).await;
                    continue;
                }
                _ => {
                    report_failures(ctx.reporter.as_ref(), &agg.failed);
                    append_journal(
                        &journal,
                        "run failed",
                        &format!("{} slot(s) failed without a retry delay.", agg.failed.len()),
                    )?;
                    report_run_usage(ctx.reporter.as_ref(), &run_usage);
                    return Ok(());
                }
            }
        }

        ctx.reporter
            .set_iteration_summary(&agg.usage, &agg.picked_by_agent);

        if agg.stop_detected {
            if suppress_stop(
                snapshot.available,
                snapshot.remaining,
                agg.picked_by_agent.len(),
            ) {
                append_journal(
                    &journal,
                    "stop marker suppressed",
                    "Marker seen while remaining work was already claimed or nothing was picked.",
                )?;
            } else {
                ctx.reporter
                    .set_loop_notice(Tone::Success, "agent reported no tasks available");
                append_journal(&journal, "run stopped", "Exhaustion marker honored.")?;
                report_run_usage(ctx.reporter.as_ref(), &run_usage);
                return Ok(());
            }
        }

        if state.current_iteration < state.max_iterations && options.pause_ms > 0 {
            pause_countdown(ctx.reporter.as_ref(), options.pause_ms).await;
        }
    }

    if state.circuit_broken() {
        ctx.reporter.set_loop_notice(
            Tone::Info,
            &format!("iteration limit reached ({})", state.max_iterations),
        );
        append_journal(&journal, "run completed", "Iteration budget exhausted.")?;
    }
    report_run_usage(ctx.reporter.as_ref(), &run_usage);
    Ok(())
}

/// Launch all slots for one iteration and collect their outputs in slot-id
/// order.
async fn run_iteration(
    ctx: Arc<IterationContext>,
) -> Result<(
    Vec<RunResult>,
    BTreeMap<u16, String>,
    BTreeMap<u16, SlotReviewOutcome>,
)> {
    let mut handles = Vec::new();
    for agent_id in 1..=ctx.options.parallel_agents {
        let ctx = ctx.clone();
        handles.push(tokio::spawn(run_slot(ctx, agent_id)));
    }

    let mut results = Vec::new();
    let mut picks = BTreeMap::new();
    let mut reviews = BTreeMap::new();
    for handle in handles {
        let output = handle.await.context("slot task panicked")??;
        if let Some(task_id) = output.picked {
            picks.insert(output.run.agent_id, task_id);
        }
        if let Some(review) = output.review {
            reviews.insert(output.run.agent_id, review);
        }
        results.push(output.run);
    }
    Ok((results, picks, reviews))
}

fn remaining_index(snapshot: &TaskSnapshot) -> BTreeMap<String, Task> {
    snapshot
        .remaining_issues
        .iter()
        .map(|task| (task.id.clone(), task.clone()))
        .collect()
}

/// The marker is ignored when the snapshot says it cannot mean exhaustion:
/// either nothing was picked, or every remaining task was already taken this
/// iteration.
fn suppress_stop(snapshot_available: bool, remaining: usize, picks: usize) -> bool {
    snapshot_available && (picks == 0 || remaining <= picks)
}

/// Retry only when every failure carries a parseable delay; the wait is the
/// largest of them.
fn retry_wait_seconds(provider: &dyn Provider, failed: &[IterationFailure]) -> Option<u64> {
    let mut wait = 0u64;
    for failure in failed {
        let delay = provider.extract_retry_delay_seconds(&failure.combined_output)?;
        wait = wait.max(delay);
    }
    (!failed.is_empty()).then_some(wait)
}

fn scope_guidance(top_level_task_id: &str) -> String {
    format!(
        "\n\n## Top-level scope\n- Work only on tasks that are direct children of {top_level_task_id}.\n- If no remaining scoped tasks exist, emit `{STOP_MARKER}` and stop.\n"
    )
}

fn report_failures(reporter: &dyn Reporter, failed: &[IterationFailure]) {
    for failure in failed {
        let status = failure
            .status
            .map(|code| code.to_string())
            .unwrap_or_else(|| "none".to_string());
        reporter.set_loop_notice(
            Tone::Error,
            &format!("agent {} failed (status {status})", failure.agent_id),
        );
        for line in &failure.raw_tail {
            reporter.set_loop_notice(Tone::Muted, line);
        }
    }
}

fn report_run_usage(reporter: &dyn Reporter, usage: &UsageSummary) {
    if !usage.is_empty() {
        reporter.set_loop_notice(
            Tone::Muted,
            &format!(
                "run usage: {} in / {} cached / {} out",
                usage.input_tokens, usage.cached_input_tokens, usage.output_tokens
            ),
        );
    }
}

async fn retry_countdown(reporter: &dyn Reporter, wait_secs: u64) {
    let mut remaining = wait_secs;
    while remaining > 0 {
        reporter.set_retry_state(Some(remaining));
        tokio::time::sleep(Duration::from_secs(1)).await;
        remaining -= 1;
    }
    reporter.set_retry_state(None);
}

async fn pause_countdown(reporter: &dyn Reporter, pause_ms: u64) {
    let mut remaining_ms = pause_ms;
    while remaining_ms >= 1000 {
        reporter.set_pause_state(Some(remaining_ms / 1000));
        tokio::time::sleep(Duration::from_secs(1)).await;
        remaining_ms -= 1000;
    }
    if remaining_ms > 0 {
        tokio::time::sleep(Duration::from_millis(remaining_ms)).await;
    }
    reporter.set_pause_state(None);
}

fn append_journal(journal: &Path, title: &str, body: &str) -> Result<()> {
    fsutil::append_text(
        journal,
        &format!("\n## {}\n**{title}**\n{body}\n", Utc::now().to_rfc3339()),
    )
}

fn journal_iteration(journal: &Path, state: &IterationState, agg: &AggregatedIteration) -> Result<()> {
    let mut body = String::new();
    if agg.picked_by_agent.is_empty() {
        body.push_str("No picks observed.\n");
    }
    for (agent_id, task_id) in &agg.picked_by_agent {
        body.push_str(&format!("- agent {agent_id} picked {task_id}\n"));
    }
    if !agg.usage.is_empty() {
        body.push_str(&format!(
            "- usage: {} in / {} cached / {} out\n",
            agg.usage.input_tokens, agg.usage.cached_input_tokens, agg.usage.output_tokens
        ));
    }
    if !agg.failed.is_empty() {
        body.push_str(&format!("- failures: {}\n", agg.failed.len()));
    }
    append_journal(
        journal,
        &format!(
            "iteration {}/{}",
            state.current_iteration, state.max_iterations
        ),
        body.trim_end(),
    )
}
