use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Result};
use crossterm::style::Stylize;

use crate::providers::{PreviewEntry, PreviewKind, UsageSummary};
use crate::tracker::TaskSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Muted,
    Info,
    Success,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    Starting,
    Streaming,
    Collecting,
}

impl LoopPhase {
    fn as_str(&self) -> &'static str {
        match self {
            LoopPhase::Starting => "starting",
            LoopPhase::Streaming => "streaming",
            LoopPhase::Collecting => "collecting",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Theme {
    Default,
    Dark,
    Light,
    Mono,
}

impl Theme {
    /// Accepts a known theme name or a path to a theme file; paths fall back
    /// to default styling.
    pub fn resolve(name_or_path: &str) -> Result<Theme> {
        match name_or_path {
            "default" => Ok(Theme::Default),
            "dark" => Ok(Theme::Dark),
            "light" => Ok(Theme::Light),
            "mono" => Ok(Theme::Mono),
            other if Path::new(other).exists() => Ok(Theme::Default),
            other => Err(anyhow!(
                "unknown theme '{other}' (known themes: default, dark, light, mono)"
            )),
        }
    }
}

/// Observer over loop progress. The core never depends on a renderer being
/// present; every operation is a no-op by default.
#[allow(unused_variables)]
pub trait Reporter: Send + Sync {
    fn set_iteration(&self, current: u32, max: u32) {}
    fn set_run_context(&self, run_dir: &Path, provider: &str) {}
    fn set_tasks_snapshot(&self, snapshot: &TaskSnapshot) {}
    fn update(&self, agent_id: u16, entries: &[PreviewEntry]) {}
    fn set_iteration_summary(&self, usage: &UsageSummary, picks: &BTreeMap<u16, String>) {}
    fn set_loop_notice(&self, tone: Tone, message: &str) {}
    fn set_loop_phase(&self, phase: LoopPhase) {}
    fn set_pause_state(&self, remaining_secs: Option<u64>) {}
    fn set_retry_state(&self, remaining_secs: Option<u64>) {}
    fn set_agent_queued(&self, agent_id: u16) {}
    fn set_agent_launching(&self, agent_id: u16) {}
    fn set_agent_picked_task(&self, agent_id: u16, task_id: &str) {}
    fn set_agent_review_phase(&self, agent_id: u16, phase: &str) {}
    fn clear_agent_review_phase(&self, agent_id: u16) {}
    fn stop(&self, tone: Tone) {}
}

/// Reporter that renders nothing; used when the caller wants raw child
/// output only, and in tests.
pub struct NullReporter;

impl Reporter for NullReporter {}

/// Plain line-oriented console reporter. Honors NO_COLOR and the mono theme.
pub struct ConsoleReporter {
    color: bool,
    preview_lines: usize,
}

impl ConsoleReporter {
    pub fn new(theme: Theme, preview_lines: usize) -> Self {
        let color = theme != Theme::Mono && std::env::var_os("NO_COLOR").is_none();
        Self {
            color,
            preview_lines,
        }
    }

    fn line(&self, tone: Tone, message: &str) {
        if !self.color {
            println!("{message}");
            return;
        }
        let styled = match tone {
            Tone::Muted => message.dark_grey().to_string(),
            Tone::Info => message.to_string(),
            Tone::Success => message.green().to_string(),
            Tone::Warn => message.yellow().to_string(),
            Tone::Error => message.red().to_string(),
        };
        println!("{styled}");
    }

    fn entry_tone(kind: PreviewKind) -> Tone {
        match kind {
            PreviewKind::Assistant | PreviewKind::Message => Tone::Info,
            PreviewKind::Tool | PreviewKind::Reasoning => Tone::Muted,
            PreviewKind::Error => Tone::Error,
        }
    }
}

impl Reporter for ConsoleReporter {
    fn set_iteration(&self, current: u32, max: u32) {
        self.line(Tone::Info, &format!("── iteration {current}/{max} ──"));
    }

    fn set_run_context(&self, run_dir: &Path, provider: &str) {
        self.line(
            Tone::Muted,
            &format!("provider {provider}; logs in {}", run_dir.display()),
        );
    }

    fn set_tasks_snapshot(&self, snapshot: &TaskSnapshot) {
        if snapshot.available {
            self.line(
                Tone::Muted,
                &format!(
                    "{}: {} remaining ({} open, {} in progress, {} blocked)",
                    snapshot.source, snapshot.remaining, snapshot.open, snapshot.in_progress,
                    snapshot.blocked
                ),
            );
        } else {
            let reason = snapshot.error.as_deref().unwrap_or("unknown");
            self.line(Tone::Warn, &format!("tracker unavailable: {reason}"));
        }
    }

    fn update(&self, agent_id: u16, entries: &[PreviewEntry]) {
        let start = entries.len().saturating_sub(self.preview_lines);
        for entry in &entries[start..] {
            let text = entry.text.lines().next().unwrap_or_default();
            self.line(
                Self::entry_tone(entry.kind),
                &format!("[agent {agent_id}] {}: {text}", entry.label),
            );
        }
    }

    fn set_iteration_summary(&self, usage: &UsageSummary, picks: &BTreeMap<u16, String>) {
        if !usage.is_empty() {
            self.line(
                Tone::Muted,
                &format!(
                    "usage: {} in / {} cached / {} out",
                    usage.input_tokens, usage.cached_input_tokens, usage.output_tokens
                ),
            );
        }
        for (agent_id, task_id) in picks {
            self.line(Tone::Success, &format!("agent {agent_id} → {task_id}"));
        }
    }

    fn set_loop_notice(&self, tone: Tone, message: &str) {
        self.line(tone, message);
    }

    fn set_loop_phase(&self, phase: LoopPhase) {
        self.line(Tone::Muted, phase.as_str());
    }

    fn set_pause_state(&self, remaining_secs: Option<u64>) {
        if let Some(secs) = remaining_secs {
            self.line(Tone::Muted, &format!("paused; next iteration in {secs}s"));
        }
    }

    fn set_retry_state(&self, remaining_secs: Option<u64>) {
        if let Some(secs) = remaining_secs {
            self.line(Tone::Warn, &format!("throttled; retrying in {secs}s"));
        }
    }

    fn set_agent_queued(&self, agent_id: u16) {
        self.line(Tone::Muted, &format!("[agent {agent_id}] queued"));
    }

    fn set_agent_launching(&self, agent_id: u16) {
        self.line(Tone::Muted, &format!("[agent {agent_id}] launching"));
    }

    fn set_agent_picked_task(&self, agent_id: u16, task_id: &str) {
        self.line(Tone::Success, &format!("[agent {agent_id}] picked {task_id}"));
    }

    fn set_agent_review_phase(&self, agent_id: u16, phase: &str) {
        self.line(Tone::Muted, &format!("[agent {agent_id}] {phase}"));
    }

    fn clear_agent_review_phase(&self, _agent_id: u16) {}

    fn stop(&self, _tone: Tone) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_theme_names_resolve() {
        assert_eq!(Theme::resolve("default").unwrap(), Theme::Default);
        assert_eq!(Theme::resolve("mono").unwrap(), Theme::Mono);
        assert!(Theme::resolve("neon").is_err());
    }

    #[test]
    fn theme_paths_fall_back_to_default() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let theme = Theme::resolve(file.path().to_str().unwrap()).unwrap();
        assert_eq!(theme, Theme::Default);
    }

    #[test]
    fn null_reporter_accepts_everything() {
        let reporter = NullReporter;
        reporter.set_iteration(1, 2);
        reporter.set_loop_notice(Tone::Error, "nothing happens");
        reporter.stop(Tone::Warn);
    }
}
