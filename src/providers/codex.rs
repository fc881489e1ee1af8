use std::path::Path;

use serde_json::Value;

use crate::providers::{ExecOptions, PreviewEntry, PreviewKind, Provider, UsageSummary};

/// Adapter for `codex exec --experimental-json`: one JSON event per stdout
/// line (`thread.started`, `item.completed`, `turn.completed`, `error`).
/// The prompt travels on stdin; the final assistant message is written by
/// codex itself via `--output-last-message`.
pub struct CodexProvider;

impl Provider for CodexProvider {
    fn name(&self) -> &'static str {
        "codex"
    }

    fn default_command(&self) -> &'static str {
        "codex"
    }

    fn build_exec_args(
        &self,
        _prompt: &str,
        last_message_path: &Path,
        options: ExecOptions<'_>,
    ) -> Vec<String> {
        let mut args = vec![
            "exec".to_string(),
            "--experimental-json".to_string(),
            "--output-last-message".to_string(),
            last_message_path.display().to_string(),
        ];
        if let Some(model) = options.model {
            args.push("--model".to_string());
            args.push(model.to_string());
        }
        if let Some(effort) = options.reasoning_effort {
            args.push("--config".to_string());
            args.push(format!("model_reasoning_effort=\"{effort}\""));
        }
        if options.yolo {
            args.push("--dangerously-bypass-approvals-and-sandbox".to_string());
        } else {
            args.push("--sandbox".to_string());
            args.push("workspace-write".to_string());
        }
        args
    }

    fn preview_entries_from_line(&self, line: &str) -> Vec<PreviewEntry> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
            return Vec::new();
        };

        match value.get("type").and_then(Value::as_str) {
            Some("item.completed") => item_entry(value.get("item")).into_iter().collect(),
            Some("error") => value
                .get("message")
                .and_then(Value::as_str)
                .map(|message| vec![PreviewEntry::new(PreviewKind::Error, "error", message)])
                .unwrap_or_default(),
            Some("turn.failed") => value
                .pointer("/error/message")
                .and_then(Value::as_str)
                .map(|message| vec![PreviewEntry::new(PreviewKind::Error, "turn failed", message)])
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    fn extract_usage_summary(&self, output: &str) -> Option<UsageSummary> {
        let mut total = UsageSummary::default();
        let mut seen = false;
        for line in output.lines() {
            let Ok(value) = serde_json::from_str::<Value>(line.trim()) else {
                continue;
            };
            if value.get("type").and_then(Value::as_str) != Some("turn.completed") {
                continue;
            }
            let Some(usage) = value.get("usage") else {
                continue;
            };
            seen = true;
            total.add(&UsageSummary {
                input_tokens: usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
                cached_input_tokens: usage
                    .get("cached_input_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
                output_tokens: usage
                    .get("output_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
            });
        }
        seen.then_some(total)
    }

    fn format_command_hint(&self, command: &str) -> String {
        format!("{command} exec --experimental-json")
    }
}

fn item_entry(item: Option<&Value>) -> Option<PreviewEntry> {
    let item = item?;
    match item.get("type").and_then(Value::as_str)? {
        "agent_message" => {
            let text = item.get("text").and_then(Value::as_str)?;
            Some(PreviewEntry::new(PreviewKind::Assistant, "assistant", text))
        }
        "reasoning" => {
            let text = item.get("text").and_then(Value::as_str)?;
            Some(PreviewEntry::new(PreviewKind::Reasoning, "reasoning", text))
        }
        "command_execution" => {
            let command = item.get("command").and_then(Value::as_str)?;
            Some(PreviewEntry::new(PreviewKind::Tool, "command", command))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;

    #[test]
    fn agent_message_becomes_assistant_entry() {
        let entries = CodexProvider.preview_entries_from_line(
            r#"{"type":"item.completed","item":{"type":"agent_message","text":"hello"}}"#,
        );
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, PreviewKind::Assistant);
        assert_eq!(entries[0].text, "hello");
    }

    #[test]
    fn command_execution_becomes_tool_entry() {
        let entries = CodexProvider.preview_entries_from_line(
            r#"{"type":"item.completed","item":{"type":"command_execution","command":"cargo test"}}"#,
        );
        assert_eq!(entries[0].kind, PreviewKind::Tool);
        assert_eq!(entries[0].text, "cargo test");
    }

    #[test]
    fn non_json_lines_are_ignored() {
        assert!(CodexProvider.preview_entries_from_line("plain text").is_empty());
        assert!(CodexProvider.preview_entries_from_line("").is_empty());
    }

    #[test]
    fn usage_sums_across_turns() {
        let output = concat!(
            "{\"type\":\"turn.completed\",\"usage\":{\"input_tokens\":10,\"cached_input_tokens\":5,\"output_tokens\":2}}\n",
            "{\"type\":\"item.completed\",\"item\":{\"type\":\"agent_message\",\"text\":\"hi\"}}\n",
            "{\"type\":\"turn.completed\",\"usage\":{\"input_tokens\":1,\"cached_input_tokens\":0,\"output_tokens\":3}}\n",
        );
        assert_eq!(
            CodexProvider.extract_usage_summary(output),
            Some(UsageSummary {
                input_tokens: 11,
                cached_input_tokens: 5,
                output_tokens: 5,
            })
        );
    }

    #[test]
    fn usage_absent_without_turn_events() {
        assert_eq!(CodexProvider.extract_usage_summary("no json here"), None);
    }

    #[test]
    fn exec_args_cover_model_effort_and_yolo() {
        let args = CodexProvider.build_exec_args(
            "ignored",
            &PathBuf::from("/tmp/last.txt"),
            ExecOptions {
                model: Some("gpt-5-codex"),
                reasoning_effort: Some("high"),
                yolo: true,
            },
        );
        assert_eq!(args[0], "exec");
        assert!(args.contains(&"--experimental-json".to_string()));
        assert!(args.contains(&"--output-last-message".to_string()));
        assert!(args.contains(&"gpt-5-codex".to_string()));
        assert!(args.contains(&"model_reasoning_effort=\"high\"".to_string()));
        assert!(args.contains(&"--dangerously-bypass-approvals-and-sandbox".to_string()));
    }

    #[test]
    fn sandbox_mode_is_the_non_yolo_default() {
        let args = CodexProvider.build_exec_args(
            "ignored",
            &PathBuf::from("/tmp/last.txt"),
            ExecOptions::default(),
        );
        assert!(args.contains(&"--sandbox".to_string()));
        assert!(args.contains(&"workspace-write".to_string()));
    }
}
