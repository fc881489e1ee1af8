use std::path::Path;
use std::sync::{Arc, LazyLock};

use anyhow::{anyhow, Result};
use regex::Regex;
use serde_json::Value;

mod claude;
mod codex;

pub use claude::ClaudeProvider;
pub use codex::CodexProvider;

/// Exhaustion token an implementer emits when the tracker has no work left.
pub const STOP_MARKER: &str = "no_tasks_available";
/// Older agent prompts still emit this spelling; honored on read only.
pub const LEGACY_STOP_MARKER: &str = "no_beads_available";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewKind {
    Assistant,
    Tool,
    Reasoning,
    Error,
    Message,
}

/// One conversational preview item parsed from an agent stdout line.
#[derive(Debug, Clone)]
pub struct PreviewEntry {
    pub kind: PreviewKind,
    pub label: String,
    pub text: String,
}

impl PreviewEntry {
    pub fn new(kind: PreviewKind, label: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            kind,
            label: label.into(),
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageSummary {
    pub input_tokens: u64,
    pub cached_input_tokens: u64,
    pub output_tokens: u64,
}

impl UsageSummary {
    pub fn add(&mut self, other: &UsageSummary) {
        self.input_tokens += other.input_tokens;
        self.cached_input_tokens += other.cached_input_tokens;
        self.output_tokens += other.output_tokens;
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Per-spawn knobs an adapter turns into CLI arguments.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecOptions<'a> {
    pub model: Option<&'a str>,
    pub reasoning_effort: Option<&'a str>,
    pub yolo: bool,
}

/// Adapter over one agent CLI's wire format. Implementations are stateless
/// and shared across slots.
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    fn default_command(&self) -> &'static str;

    fn build_exec_args(
        &self,
        prompt: &str,
        last_message_path: &Path,
        options: ExecOptions<'_>,
    ) -> Vec<String>;

    /// Parse one raw stdout line into preview entries. Lenient: non-JSON and
    /// unrecognized events yield nothing.
    fn preview_entries_from_line(&self, line: &str) -> Vec<PreviewEntry>;

    fn extract_usage_summary(&self, output: &str) -> Option<UsageSummary>;

    fn format_command_hint(&self, command: &str) -> String;

    fn collect_messages(&self, combined_output: &str) -> Vec<PreviewEntry> {
        combined_output
            .lines()
            .flat_map(|line| self.preview_entries_from_line(line))
            .collect()
    }

    fn collect_raw_json_lines(&self, output: &str, n: usize) -> Vec<String> {
        collect_raw_json_lines(output, n)
    }

    fn extract_retry_delay_seconds(&self, output: &str) -> Option<u64> {
        extract_retry_delay_seconds(output)
    }

    fn has_stop_marker(&self, text: &str) -> bool {
        has_stop_marker(text)
    }
}

pub fn provider_by_name(name: &str) -> Result<Arc<dyn Provider>> {
    match name {
        "codex" => Ok(Arc::new(CodexProvider)),
        "claude" => Ok(Arc::new(ClaudeProvider)),
        other => Err(anyhow!(
            "unknown provider '{other}' (known providers: codex, claude)"
        )),
    }
}

pub fn has_stop_marker(text: &str) -> bool {
    let lowered = text.to_lowercase();
    lowered.contains(STOP_MARKER) || lowered.contains(LEGACY_STOP_MARKER)
}

pub fn collect_raw_json_lines(output: &str, n: usize) -> Vec<String> {
    let json_lines: Vec<&str> = output
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('{') || line.starts_with('['))
        .collect();
    let start = json_lines.len().saturating_sub(n);
    json_lines[start..].iter().map(|line| line.to_string()).collect()
}

const RETRY_DELAY_KEYS: [&str; 3] = ["resets_in_seconds", "reset_seconds", "retry_after_seconds"];

static RETRY_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:try again|retry)\b[^0-9\n]*?(\d+)\s*(seconds?|minutes?)")
        .expect("retry pattern must compile")
});

/// Pull a retry delay out of throttled-agent output: integer keys anywhere in
/// nested JSON first, natural-language phrasing second.
pub fn extract_retry_delay_seconds(output: &str) -> Option<u64> {
    let mut best: Option<u64> = None;
    for line in output.lines() {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') && !trimmed.starts_with('[') {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            scan_for_delay(&value, &mut best);
        }
    }
    if best.is_none() {
        if let Ok(value) = serde_json::from_str::<Value>(output.trim()) {
            scan_for_delay(&value, &mut best);
        }
    }
    if best.is_some() {
        return best;
    }

    for capture in RETRY_TEXT.captures_iter(output) {
        let amount: u64 = match capture[1].parse() {
            Ok(amount) => amount,
            Err(_) => continue,
        };
        let seconds = if capture[2].to_lowercase().starts_with("minute") {
            amount * 60
        } else {
            amount
        };
        best = Some(best.map_or(seconds, |current| current.max(seconds)));
    }
    best
}

fn scan_for_delay(value: &Value, best: &mut Option<u64>) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                if RETRY_DELAY_KEYS.contains(&key.as_str()) {
                    if let Some(seconds) = nested.as_u64() {
                        *best = Some(best.map_or(seconds, |current| current.max(seconds)));
                    }
                }
                scan_for_delay(nested, best);
            }
        }
        Value::Array(items) => {
            for item in items {
                scan_for_delay(item, best);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_marker_accepts_both_spellings() {
        assert!(has_stop_marker("NO_TASKS_AVAILABLE"));
        assert!(has_stop_marker("done: no_beads_available today"));
        assert!(!has_stop_marker("tasks available"));
    }

    #[test]
    fn retry_delay_from_nested_json() {
        let output = r#"{"error":{"details":{"resets_in_seconds":42}}}"#;
        assert_eq!(extract_retry_delay_seconds(output), Some(42));
    }

    #[test]
    fn retry_delay_takes_largest_json_value() {
        let output = "{\"reset_seconds\":5}\n{\"retry_after_seconds\":30}";
        assert_eq!(extract_retry_delay_seconds(output), Some(30));
    }

    #[test]
    fn retry_delay_from_natural_language_minutes() {
        assert_eq!(
            extract_retry_delay_seconds("rate limited; please try again in 2 minutes"),
            Some(120)
        );
        assert_eq!(
            extract_retry_delay_seconds("Retry after 45 seconds."),
            Some(45)
        );
    }

    #[test]
    fn retry_delay_absent_when_nothing_matches() {
        assert_eq!(extract_retry_delay_seconds("permanent failure"), None);
        assert_eq!(extract_retry_delay_seconds(r#"{"status":"error"}"#), None);
    }

    #[test]
    fn raw_json_lines_keeps_the_tail() {
        let output = "noise\n{\"a\":1}\nplain\n{\"b\":2}\n[3]\n";
        assert_eq!(
            collect_raw_json_lines(output, 2),
            vec!["{\"b\":2}".to_string(), "[3]".to_string()]
        );
    }

    #[test]
    fn usage_adds_componentwise() {
        let mut total = UsageSummary::default();
        total.add(&UsageSummary {
            input_tokens: 1,
            cached_input_tokens: 2,
            output_tokens: 3,
        });
        total.add(&UsageSummary {
            input_tokens: 10,
            cached_input_tokens: 20,
            output_tokens: 30,
        });
        assert_eq!(
            total,
            UsageSummary {
                input_tokens: 11,
                cached_input_tokens: 22,
                output_tokens: 33,
            }
        );
    }

    #[test]
    fn registry_knows_bundled_providers() {
        assert_eq!(provider_by_name("codex").unwrap().name(), "codex");
        assert_eq!(provider_by_name("claude").unwrap().name(), "claude");
        assert!(provider_by_name("nope").is_err());
    }
}
