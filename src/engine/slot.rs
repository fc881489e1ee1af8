use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;

use crate::config::CliOptions;
use crate::engine::gate::StagedLaunchGate;
use crate::engine::paths::RunPaths;
use crate::engine::review::{run_slot_review, ReviewInput};
use crate::engine::shutdown::ShutdownGuard;
use crate::engine::spawn::{run_agent_process, ProcessSpec};
use crate::engine::{RunResult, SlotReviewOutcome};
use crate::providers::Provider;
use crate::render::{LoopPhase, Reporter};
use crate::tracker::{classify, Task, TaskSnapshot};

/// Everything one iteration's slots share. Built once by the controller.
pub struct IterationContext {
    pub iteration: u32,
    pub stamp: String,
    pub run_dir: PathBuf,
    pub project_root: PathBuf,
    pub options: Arc<CliOptions>,
    pub implementer: Arc<dyn Provider>,
    pub reviewer: Arc<dyn Provider>,
    pub snapshot: Arc<TaskSnapshot>,
    pub remaining: Arc<BTreeMap<String, Task>>,
    pub prompt: Arc<String>,
    pub reviewer_prompt: Option<Arc<String>>,
    pub gate: Arc<StagedLaunchGate>,
    pub guard: ShutdownGuard,
    pub reporter: Arc<dyn Reporter>,
}

pub struct SlotOutput {
    pub run: RunResult,
    pub picked: Option<String>,
    pub review: Option<SlotReviewOutcome>,
}

/// Drive one agent slot: wait at the gate, stream the implementer, classify
/// picks, and hand a clean exit to the review sub-loop when enabled.
///
/// A slot releases the gate exactly once: on its first classified pick, or
/// unconditionally at child exit so a silent slot cannot block the pipeline.
pub async fn run_slot(ctx: Arc<IterationContext>, agent_id: u16) -> Result<SlotOutput> {
    if agent_id > 1 {
        ctx.reporter.set_agent_queued(agent_id);
        ctx.gate.wait_for_picked(u32::from(agent_id) - 1).await;
    }
    ctx.reporter.set_agent_launching(agent_id);

    let paths = RunPaths::new(&ctx.run_dir, ctx.iteration, &ctx.stamp, agent_id);
    let command = ctx.options.command_for(ctx.implementer.as_ref());
    let args = ctx.implementer.build_exec_args(
        &ctx.prompt,
        &paths.last_message(),
        ctx.options.exec_options(),
    );

    let mut picked: Option<String> = None;
    let mut released = false;
    let result = run_agent_process(
        ProcessSpec {
            prompt: &ctx.prompt,
            command,
            args: &args,
            cwd: &ctx.project_root,
            log_path: &paths.jsonl_log(),
            show_raw: ctx.options.show_raw,
            command_hint: ctx.implementer.format_command_hint(command),
        },
        &ctx.guard,
        |line| {
            let entries = ctx.implementer.preview_entries_from_line(line);
            if !entries.is_empty() {
                ctx.reporter.update(agent_id, &entries);
            }
            if picked.is_some() {
                return;
            }
            let hit = classify::extract_referenced_task_ids(line, &ctx.remaining)
                .into_iter()
                .next()
                .or_else(|| {
                    entries.iter().find_map(|entry| {
                        classify::extract_referenced_task_ids(&entry.text, &ctx.remaining)
                            .into_iter()
                            .next()
                    })
                });
            if let Some(task_id) = hit {
                ctx.reporter.set_agent_picked_task(agent_id, &task_id);
                picked = Some(task_id);
                if !released {
                    released = true;
                    ctx.gate.release_picked_readiness();
                }
            }
        },
        || ctx.reporter.set_loop_phase(LoopPhase::Streaming),
    )
    .await?;

    if !released {
        ctx.gate.release_picked_readiness();
    }

    let combined = result.combined_output();
    if picked.is_none() {
        picked = classify::extract_referenced_task_ids(&combined, &ctx.remaining)
            .into_iter()
            .next();
        if let Some(task_id) = &picked {
            ctx.reporter.set_agent_picked_task(agent_id, task_id);
        }
    }

    let review = match review_target(&ctx, picked.as_deref(), result.succeeded()) {
        Some((task, reviewer_prompt)) => {
            let outcome = run_slot_review(ReviewInput {
                agent_id,
                task,
                options: &ctx.options,
                implementer: &ctx.implementer,
                reviewer: &ctx.reviewer,
                reviewer_prompt,
                implement_output: combined,
                implement_log_path: paths.jsonl_log(),
                paths: &paths,
                project_root: &ctx.project_root,
                guard: &ctx.guard,
                reporter: &ctx.reporter,
            })
            .await?;
            ctx.reporter.clear_agent_review_phase(agent_id);
            Some(outcome)
        }
        None => None,
    };

    Ok(SlotOutput {
        run: RunResult {
            agent_id,
            jsonl_log_path: paths.jsonl_log(),
            last_message_path: paths.last_message(),
            result,
        },
        picked,
        review,
    })
}

/// Review runs only when enabled, a reviewer prompt exists, the picked task
/// is known, and the implementer exited cleanly.
fn review_target<'a>(
    ctx: &'a IterationContext,
    picked: Option<&str>,
    implement_succeeded: bool,
) -> Option<(&'a Task, &'a str)> {
    if !ctx.options.review_enabled || !implement_succeeded {
        return None;
    }
    let reviewer_prompt = ctx.reviewer_prompt.as_ref()?.as_str();
    let task = ctx.snapshot.by_id.get(picked?)?;
    Some((task, reviewer_prompt))
}
