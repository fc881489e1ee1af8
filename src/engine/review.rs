use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;
use tokio::process::Command;

use crate::config::CliOptions;
use crate::engine::paths::RunPaths;
use crate::engine::shutdown::ShutdownGuard;
use crate::engine::spawn::{run_agent_process, ProcessSpec, StreamResult};
use crate::engine::{ReviewVerdict, SlotReviewOutcome};
use crate::providers::{PreviewEntry, PreviewKind, Provider};
use crate::render::Reporter;
use crate::tracker::Task;

const DIFF_TIMEOUT: Duration = Duration::from_secs(15);
const DIFF_MAX_BYTES: usize = 1024 * 1024;
const CONTEXT_SECTION_MAX_BYTES: usize = 50_000;
const DIFF_UNAVAILABLE: &str = "(git diff unavailable)";

pub struct ReviewInput<'a> {
    pub agent_id: u16,
    pub task: &'a Task,
    pub options: &'a CliOptions,
    pub implementer: &'a Arc<dyn Provider>,
    pub reviewer: &'a Arc<dyn Provider>,
    pub reviewer_prompt: &'a str,
    pub implement_output: String,
    pub implement_log_path: PathBuf,
    pub paths: &'a RunPaths,
    pub project_root: &'a Path,
    pub guard: &'a ShutdownGuard,
    pub reporter: &'a Arc<dyn Reporter>,
}

/// Drive the reviewer over one slot's change, escalating drift to the
/// implementer until the verdict passes or the attempt budget runs out.
///
/// Reviewer and fixer output never feeds back into the implementer's
/// combined output, so a stop marker inside review text cannot end the
/// outer loop.
pub async fn run_slot_review(input: ReviewInput<'_>) -> Result<SlotReviewOutcome> {
    let max = input.options.review_max_fix_attempts;
    let mut fix_attempt: u32 = 0;
    let mut implement_output = input.implement_output;
    let mut implement_log = input.implement_log_path;
    let mut previous_follow_up: Option<String> = None;

    loop {
        let round = fix_attempt + 1;
        input
            .reporter
            .set_agent_review_phase(input.agent_id, &format!("reviewing (round {round})"));

        let diff = capture_diff(input.project_root).await;
        let context = build_review_context(
            input.task,
            fix_attempt,
            previous_follow_up.as_deref(),
            &implement_output,
            &implement_log,
            &diff,
            input.options.parallel_agents,
        );
        let reviewer_prompt = format!("{}\n\n{context}", input.reviewer_prompt.trim_end());

        let review_last_message = input.paths.review_last_message(round);
        let reviewer_command = input.options.reviewer_command_for(input.reviewer.as_ref());
        let args = input.reviewer.build_exec_args(
            &reviewer_prompt,
            &review_last_message,
            input.options.reviewer_exec_options(),
        );
        let review_log = input.paths.review_log(round);
        let result = run_agent_process(
            ProcessSpec {
                prompt: &reviewer_prompt,
                command: reviewer_command,
                args: &args,
                cwd: input.project_root,
                log_path: &review_log,
                show_raw: input.options.show_raw,
                command_hint: input.reviewer.format_command_hint(reviewer_command),
            },
            input.guard,
            |_| {},
            || {},
        )
        .await?;

        if !result.succeeded() {
            return Ok(failed(
                fix_attempt,
                None,
                format!(
                    "reviewer process exited with status {}",
                    status_label(&result)
                ),
            ));
        }

        let response =
            reviewer_response_text(input.reviewer.as_ref(), &result.stdout, &review_last_message);
        let verdict = parse_review_verdict(&response);
        match verdict {
            ReviewVerdict::ContractViolation { ref reason, ref raw } => {
                input.reporter.update(
                    input.agent_id,
                    &[PreviewEntry::new(PreviewKind::Error, "reviewer", raw.as_str())],
                );
                let reason = format!("reviewer contract violation: {reason}");
                return Ok(failed(fix_attempt, Some(verdict), reason));
            }
            ReviewVerdict::Pass { .. } => {
                return Ok(SlotReviewOutcome {
                    passed: true,
                    fix_attempts: fix_attempt,
                    last_verdict: Some(verdict),
                    failure_reason: None,
                });
            }
            ReviewVerdict::Drift {
                ref follow_up_prompt,
            } => {
                if fix_attempt == max {
                    return Ok(failed(
                        max,
                        Some(verdict.clone()),
                        format!("drift unresolved after {max} fix attempt(s)"),
                    ));
                }

                let fix_round = fix_attempt + 1;
                input
                    .reporter
                    .set_agent_review_phase(input.agent_id, &format!("fixing (attempt {fix_round})"));

                let fix_prompt = format!(
                    "The reviewer found drift in your implementation of task {}: {}\n\nReviewer feedback:\n{}\n\nPlease fix the issues described above.",
                    input.task.id, input.task.title, follow_up_prompt
                );
                let fix_last_message = input.paths.fix_last_message(fix_round);
                let implement_command = input.options.command_for(input.implementer.as_ref());
                let fix_args = input.implementer.build_exec_args(
                    &fix_prompt,
                    &fix_last_message,
                    input.options.exec_options(),
                );
                let fix_log = input.paths.fix_log(fix_round);
                let fix_result = run_agent_process(
                    ProcessSpec {
                        prompt: &fix_prompt,
                        command: implement_command,
                        args: &fix_args,
                        cwd: input.project_root,
                        log_path: &fix_log,
                        show_raw: input.options.show_raw,
                        command_hint: input.implementer.format_command_hint(implement_command),
                    },
                    input.guard,
                    |_| {},
                    || {},
                )
                .await?;

                if !fix_result.succeeded() {
                    return Ok(failed(
                        fix_round,
                        Some(verdict.clone()),
                        format!(
                            "fixer process exited with status {}",
                            status_label(&fix_result)
                        ),
                    ));
                }

                implement_output = fix_result.combined_output();
                implement_log = fix_log;
                previous_follow_up = Some(follow_up_prompt.clone());
                fix_attempt = fix_round;
            }
        }
    }
}

fn failed(fix_attempts: u32, last_verdict: Option<ReviewVerdict>, reason: String) -> SlotReviewOutcome {
    SlotReviewOutcome {
        passed: false,
        fix_attempts,
        last_verdict,
        failure_reason: Some(reason),
    }
}

fn status_label(result: &StreamResult) -> String {
    match result.status {
        Some(code) => code.to_string(),
        None => "killed".to_string(),
    }
}

/// The reviewer's response body: the last-message file when the adapter
/// produced one, otherwise assistant/message preview text, otherwise the raw
/// stdout.
fn reviewer_response_text(provider: &dyn Provider, stdout: &str, last_message_path: &Path) -> String {
    if let Ok(text) = std::fs::read_to_string(last_message_path) {
        if !text.trim().is_empty() {
            return text;
        }
    }
    let messages: Vec<String> = provider
        .collect_messages(stdout)
        .into_iter()
        .filter(|entry| matches!(entry.kind, PreviewKind::Assistant | PreviewKind::Message))
        .map(|entry| entry.text)
        .collect();
    if !messages.is_empty() {
        return messages.join("\n");
    }
    stdout.to_string()
}

/// Strict verdict parse: the object bracketed by the first `{` and the last
/// `}` must be `{"verdict":"pass"|"drift","followUpPrompt":"<string>"}`.
pub fn parse_review_verdict(raw: &str) -> ReviewVerdict {
    let violation = |reason: &str| ReviewVerdict::ContractViolation {
        reason: reason.to_string(),
        raw: raw.to_string(),
    };

    let trimmed = raw.trim();
    let (start, end) = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => (start, end),
        _ => return violation("no JSON object found"),
    };

    let value: Value = match serde_json::from_str(&trimmed[start..=end]) {
        Ok(value) => value,
        Err(err) => return violation(&format!("invalid JSON: {err}")),
    };
    let Value::Object(map) = value else {
        return violation("response is not a JSON object");
    };

    let verdict = match map.get("verdict").and_then(Value::as_str) {
        Some(verdict) => verdict,
        None => return violation("missing \"verdict\" string"),
    };
    let follow_up_prompt = match map.get("followUpPrompt").and_then(Value::as_str) {
        Some(prompt) => prompt.to_string(),
        None => return violation("\"followUpPrompt\" must be a string"),
    };

    match verdict {
        "pass" => ReviewVerdict::Pass { follow_up_prompt },
        "drift" => ReviewVerdict::Drift { follow_up_prompt },
        other => violation(&format!("verdict must be \"pass\" or \"drift\", got \"{other}\"")),
    }
}

async fn capture_diff(project_root: &Path) -> String {
    let output = tokio::time::timeout(
        DIFF_TIMEOUT,
        Command::new("git")
            .args(["diff", "HEAD"])
            .current_dir(project_root)
            .output(),
    )
    .await;

    match output {
        Ok(Ok(output)) if output.status.success() => {
            let text = String::from_utf8_lossy(&output.stdout);
            truncate_bytes(&text, DIFF_MAX_BYTES).to_string()
        }
        _ => DIFF_UNAVAILABLE.to_string(),
    }
}

fn build_review_context(
    task: &Task,
    fix_attempt: u32,
    previous_follow_up: Option<&str>,
    implement_output: &str,
    implement_log: &Path,
    diff: &str,
    parallel_agents: u16,
) -> String {
    let mut context = String::new();

    context.push_str("## Task under review\n");
    context.push_str(&format!("- id: {}\n", task.id));
    context.push_str(&format!("- title: {}\n", task.title));
    context.push_str(&format!("- status: {}\n", task.status));
    match task.priority {
        Some(priority) => context.push_str(&format!("- priority: {priority}\n")),
        None => context.push_str("- priority: none\n"),
    }

    if fix_attempt > 0 {
        context.push_str(&format!("\n## Fix attempt {fix_attempt}\n"));
        context.push_str("Previous reviewer feedback:\n");
        context.push_str(previous_follow_up.unwrap_or(""));
        context.push('\n');
    }

    context.push_str(&format!(
        "\n## Implementer output (full log: {})\n",
        implement_log.display()
    ));
    context.push_str(truncate_bytes(implement_output, CONTEXT_SECTION_MAX_BYTES));
    context.push('\n');

    context.push_str("\n## Working tree diff (git diff HEAD)\n");
    context.push_str(truncate_bytes(diff, CONTEXT_SECTION_MAX_BYTES));
    context.push('\n');

    if parallel_agents > 1 {
        context.push_str(&format!(
            "\n## Parallel agents\n{parallel_agents} agents share this working tree. Review only the change for task {}; unrelated edits belong to other agents.\n",
            task.id
        ));
    }

    context.push_str(
        "\n## Response contract\nRespond with exactly one JSON object: {\"verdict\":\"pass\"|\"drift\",\"followUpPrompt\":\"<string>\"}. Use \"pass\" when the change satisfies the task; use \"drift\" when it does not, and put concrete fix instructions in followUpPrompt. Any other response is a contract violation.\n",
    );

    context
}

fn truncate_bytes(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::providers::{ExecOptions, PreviewEntry};
    use crate::tracker::STATUS_IN_PROGRESS;

    fn task() -> Task {
        Task {
            id: "task-1".to_string(),
            title: "wire the pump".to_string(),
            status: STATUS_IN_PROGRESS.to_string(),
            priority: Some(2),
            assignee: None,
        }
    }

    #[test]
    fn verdict_pass_round_trips() {
        let verdict = parse_review_verdict(r#"{"verdict":"pass","followUpPrompt":"ok"}"#);
        assert_eq!(
            verdict,
            ReviewVerdict::Pass {
                follow_up_prompt: "ok".to_string()
            }
        );
    }

    #[test]
    fn verdict_tolerates_surrounding_text() {
        let verdict = parse_review_verdict(
            "Here is my verdict:\n{\"verdict\":\"drift\",\"followUpPrompt\":\"add error handling\"}\nthanks",
        );
        assert_eq!(
            verdict,
            ReviewVerdict::Drift {
                follow_up_prompt: "add error handling".to_string()
            }
        );
    }

    #[test]
    fn plain_text_is_a_contract_violation() {
        let verdict = parse_review_verdict("LGTM");
        let ReviewVerdict::ContractViolation { reason, .. } = verdict else {
            panic!("expected contract violation");
        };
        assert!(reason.contains("no JSON object found"));
    }

    #[test]
    fn array_payload_is_a_contract_violation() {
        // First `{` and last `}` bracket the inner object of an array, so the
        // slice parses but the verdict field is missing.
        let verdict = parse_review_verdict(r#"[{"verdict":"pass"}]"#);
        assert!(matches!(verdict, ReviewVerdict::ContractViolation { .. }));
    }

    #[test]
    fn unknown_verdict_word_is_a_contract_violation() {
        let verdict = parse_review_verdict(r#"{"verdict":"maybe","followUpPrompt":"x"}"#);
        let ReviewVerdict::ContractViolation { reason, .. } = verdict else {
            panic!("expected contract violation");
        };
        assert!(reason.contains("pass"));
    }

    #[test]
    fn missing_follow_up_is_a_contract_violation() {
        let verdict = parse_review_verdict(r#"{"verdict":"pass"}"#);
        assert!(matches!(verdict, ReviewVerdict::ContractViolation { .. }));
    }

    #[test]
    fn context_names_the_task_and_contract() {
        let context = build_review_context(
            &task(),
            0,
            None,
            "implementer said things",
            Path::new("/logs/agent.jsonl"),
            "diff --git a b",
            1,
        );
        assert!(context.contains("- id: task-1"));
        assert!(context.contains("- priority: 2"));
        assert!(context.contains("implementer said things"));
        assert!(context.contains("/logs/agent.jsonl"));
        assert!(context.contains("Response contract"));
        assert!(!context.contains("Fix attempt"));
        assert!(!context.contains("Parallel agents"));
    }

    #[test]
    fn context_adds_fix_heading_and_parallel_warning() {
        let context = build_review_context(
            &task(),
            2,
            Some("tighten the tests"),
            "output",
            Path::new("/logs/fix-2.jsonl"),
            DIFF_UNAVAILABLE,
            3,
        );
        assert!(context.contains("## Fix attempt 2"));
        assert!(context.contains("tighten the tests"));
        assert!(context.contains("## Parallel agents"));
        assert!(context.contains("task task-1"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "héllo".repeat(100);
        let cut = truncate_bytes(&text, 7);
        assert!(cut.len() <= 7);
        assert!(text.starts_with(cut));
    }

    struct ScriptProvider {
        script: String,
    }

    impl Provider for ScriptProvider {
        fn name(&self) -> &'static str {
            "script"
        }

        fn default_command(&self) -> &'static str {
            "sh"
        }

        fn build_exec_args(
            &self,
            _prompt: &str,
            _last_message_path: &Path,
            _options: ExecOptions<'_>,
        ) -> Vec<String> {
            vec!["-c".to_string(), self.script.clone()]
        }

        fn preview_entries_from_line(&self, _line: &str) -> Vec<PreviewEntry> {
            Vec::new()
        }

        fn extract_usage_summary(&self, _output: &str) -> Option<crate::providers::UsageSummary> {
            None
        }

        fn format_command_hint(&self, command: &str) -> String {
            command.to_string()
        }
    }

    #[cfg(unix)]
    fn review_fixture<'a>(
        dir: &'a tempfile::TempDir,
        task: &'a Task,
        options: &'a CliOptions,
        implementer: &'a Arc<dyn Provider>,
        reviewer: &'a Arc<dyn Provider>,
        paths: &'a RunPaths,
        guard: &'a ShutdownGuard,
        reporter: &'a Arc<dyn Reporter>,
    ) -> ReviewInput<'a> {
        ReviewInput {
            agent_id: 1,
            task,
            options,
            implementer,
            reviewer,
            reviewer_prompt: "You are the reviewer.",
            implement_output: "Updated issue: task-1".to_string(),
            implement_log_path: dir.path().join("agent.jsonl"),
            paths,
            project_root: dir.path(),
            guard,
            reporter,
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn drift_then_pass_consumes_one_fix_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let task = task();
        let options = CliOptions::default();
        // First reviewer round reports drift, later rounds pass; the flag
        // file carries the state between invocations.
        let reviewer: Arc<dyn Provider> = Arc::new(ScriptProvider {
            script: "if [ -f reviewed ]; then echo '{\"verdict\":\"pass\",\"followUpPrompt\":\"ok\"}'; else touch reviewed; echo '{\"verdict\":\"drift\",\"followUpPrompt\":\"add error handling\"}'; fi".to_string(),
        });
        let implementer: Arc<dyn Provider> = Arc::new(ScriptProvider {
            script: "exit 0".to_string(),
        });
        let paths = RunPaths::new(dir.path(), 1, "20260801T000000Z", 1);
        let guard = ShutdownGuard::new();
        let reporter: Arc<dyn Reporter> = Arc::new(crate::render::NullReporter);

        let outcome = run_slot_review(review_fixture(
            &dir,
            &task,
            &options,
            &implementer,
            &reviewer,
            &paths,
            &guard,
            &reporter,
        ))
        .await
        .unwrap();

        assert!(outcome.passed);
        assert_eq!(outcome.fix_attempts, 1);
        assert!(matches!(
            outcome.last_verdict,
            Some(ReviewVerdict::Pass { .. })
        ));
        assert!(paths.review_log(1).exists());
        assert!(paths.fix_log(1).exists());
        assert!(paths.review_log(2).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn contract_violation_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let task = task();
        let options = CliOptions::default();
        let reviewer: Arc<dyn Provider> = Arc::new(ScriptProvider {
            script: "echo LGTM".to_string(),
        });
        let implementer: Arc<dyn Provider> = Arc::new(ScriptProvider {
            script: "echo should-not-run > fixer-ran; exit 0".to_string(),
        });
        let paths = RunPaths::new(dir.path(), 1, "20260801T000000Z", 1);
        let guard = ShutdownGuard::new();
        let reporter: Arc<dyn Reporter> = Arc::new(crate::render::NullReporter);

        let outcome = run_slot_review(review_fixture(
            &dir,
            &task,
            &options,
            &implementer,
            &reviewer,
            &paths,
            &guard,
            &reporter,
        ))
        .await
        .unwrap();

        assert!(!outcome.passed);
        assert_eq!(outcome.fix_attempts, 0);
        assert!(outcome
            .failure_reason
            .unwrap()
            .contains("reviewer contract violation"));
        assert!(!dir.path().join("fixer-ran").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unresolved_drift_exhausts_the_attempt_budget() {
        let dir = tempfile::tempdir().unwrap();
        let task = task();
        let options = CliOptions {
            review_max_fix_attempts: 2,
            ..CliOptions::default()
        };
        let reviewer: Arc<dyn Provider> = Arc::new(ScriptProvider {
            script: "echo '{\"verdict\":\"drift\",\"followUpPrompt\":\"still wrong\"}'".to_string(),
        });
        let implementer: Arc<dyn Provider> = Arc::new(ScriptProvider {
            script: "exit 0".to_string(),
        });
        let paths = RunPaths::new(dir.path(), 1, "20260801T000000Z", 1);
        let guard = ShutdownGuard::new();
        let reporter: Arc<dyn Reporter> = Arc::new(crate::render::NullReporter);

        let outcome = run_slot_review(review_fixture(
            &dir,
            &task,
            &options,
            &implementer,
            &reviewer,
            &paths,
            &guard,
            &reporter,
        ))
        .await
        .unwrap();

        assert!(!outcome.passed);
        assert_eq!(outcome.fix_attempts, 2);
        assert!(outcome
            .failure_reason
            .unwrap()
            .contains("drift unresolved after 2 fix attempt(s)"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reviewer_failure_status_ends_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let task = task();
        let options = CliOptions::default();
        let reviewer: Arc<dyn Provider> = Arc::new(ScriptProvider {
            script: "exit 7".to_string(),
        });
        let implementer: Arc<dyn Provider> = Arc::new(ScriptProvider {
            script: "exit 0".to_string(),
        });
        let paths = RunPaths::new(dir.path(), 1, "20260801T000000Z", 1);
        let guard = ShutdownGuard::new();
        let reporter: Arc<dyn Reporter> = Arc::new(crate::render::NullReporter);

        let outcome = run_slot_review(review_fixture(
            &dir,
            &task,
            &options,
            &implementer,
            &reviewer,
            &paths,
            &guard,
            &reporter,
        ))
        .await
        .unwrap();

        assert!(!outcome.passed);
        assert_eq!(
            outcome.failure_reason.as_deref(),
            Some("reviewer process exited with status 7")
        );
    }
}
