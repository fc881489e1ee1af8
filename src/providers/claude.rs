use std::path::Path;

use serde_json::Value;

use crate::providers::{ExecOptions, PreviewEntry, PreviewKind, Provider, UsageSummary};

/// Adapter for `claude -p --output-format stream-json`: assistant turns
/// arrive as `assistant` events with content blocks, the run summary as a
/// single `result` event. The CLI has no last-message flag, so the final
/// message surfaces through preview entries instead of the last-message
/// file.
pub struct ClaudeProvider;

impl Provider for ClaudeProvider {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn default_command(&self) -> &'static str {
        "claude"
    }

    fn build_exec_args(
        &self,
        _prompt: &str,
        _last_message_path: &Path,
        options: ExecOptions<'_>,
    ) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            "--verbose".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
        ];
        if let Some(model) = options.model {
            args.push("--model".to_string());
            args.push(model.to_string());
        }
        if options.yolo {
            args.push("--dangerously-skip-permissions".to_string());
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
            Some("assistant") => content_entries(value.pointer("/message/content")),
            Some("result") => {
                if value.get("is_error").and_then(Value::as_bool).unwrap_or(false) {
                    value
                        .get("result")
                        .and_then(Value::as_str)
                        .map(|text| vec![PreviewEntry::new(PreviewKind::Error, "error", text)])
                        .unwrap_or_default()
                } else {
                    value
                        .get("result")
                        .and_then(Value::as_str)
                        .map(|text| vec![PreviewEntry::new(PreviewKind::Message, "result", text)])
                        .unwrap_or_default()
                }
            }
            _ => Vec::new(),
        }
    }

    fn extract_usage_summary(&self, output: &str) -> Option<UsageSummary> {
        for line in output.lines().rev() {
            let Ok(value) = serde_json::from_str::<Value>(line.trim()) else {
                continue;
            };
            if value.get("type").and_then(Value::as_str) != Some("result") {
                continue;
            }
            let usage = value.get("usage")?;
            return Some(UsageSummary {
                input_tokens: usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
                cached_input_tokens: usage
                    .get("cache_read_input_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
                output_tokens: usage
                    .get("output_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
            });
        }
        None
    }

    fn format_command_hint(&self, command: &str) -> String {
        format!("{command} -p --output-format stream-json")
    }
}

fn content_entries(content: Option<&Value>) -> Vec<PreviewEntry> {
    let Some(blocks) = content.and_then(Value::as_array) else {
        return Vec::new();
    };

    let mut entries = Vec::new();
    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    entries.push(PreviewEntry::new(PreviewKind::Assistant, "assistant", text));
                }
            }
            Some("tool_use") => {
                let name = block
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("tool");
                let input = block
                    .get("input")
                    .map(|input| input.to_string())
                    .unwrap_or_default();
                entries.push(PreviewEntry::new(PreviewKind::Tool, name, input));
            }
            _ => {}
        }
    }
    entries
}
