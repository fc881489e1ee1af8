use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::ValueEnum;
use serde::Deserialize;

use crate::fsutil;
use crate::providers::{self, ExecOptions, Provider};
use crate::render::Theme;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BeadMode {
    Auto,
    TopLevel,
}

/// Everything the loop needs to know, resolved with precedence
/// CLI > project config > global config > adapter defaults.
#[derive(Debug, Clone)]
pub struct CliOptions {
    pub provider: String,
    pub reviewer_provider: String,
    pub iteration_limit: u32,
    pub iterations_set: bool,
    pub parallel_agents: u16,
    pub preview_lines: usize,
    pub pause_ms: u64,
    pub command: Option<String>,
    pub reviewer_command: Option<String>,
    pub model: Option<String>,
    pub reviewer_model: Option<String>,
    pub reasoning_effort: Option<ReasoningEffort>,
    pub yolo: bool,
    pub log_dir: PathBuf,
    pub developer_prompt_path: PathBuf,
    pub reviewer_prompt_path: Option<PathBuf>,
    pub review_enabled: bool,
    pub review_max_fix_attempts: u32,
    pub bead_mode: BeadMode,
    pub top_level_task_id: Option<String>,
    pub show_raw: bool,
    pub theme: Theme,
}

impl Default for CliOptions {
    fn default() -> Self {
        Self {
            provider: "codex".to_string(),
            reviewer_provider: "codex".to_string(),
            iteration_limit: 10,
            iterations_set: false,
            parallel_agents: 1,
            preview_lines: 5,
            pause_ms: 0,
            command: None,
            reviewer_command: None,
            model: None,
            reviewer_model: None,
            reasoning_effort: None,
            yolo: false,
            log_dir: PathBuf::from(".ai_agents/logs"),
            developer_prompt_path: PathBuf::new(),
            reviewer_prompt_path: None,
            review_enabled: false,
            review_max_fix_attempts: 3,
            bead_mode: BeadMode::Auto,
            top_level_task_id: None,
            show_raw: false,
            theme: Theme::Default,
        }
    }
}

impl CliOptions {
    pub fn exec_options(&self) -> ExecOptions<'_> {
        ExecOptions {
            model: self.model.as_deref(),
            reasoning_effort: self.reasoning_effort.map(|effort| effort.as_str()),
            yolo: self.yolo,
        }
    }

    pub fn reviewer_exec_options(&self) -> ExecOptions<'_> {
        ExecOptions {
            model: self
                .reviewer_model
                .as_deref()
                .or(self.model.as_deref()),
            reasoning_effort: self.reasoning_effort.map(|effort| effort.as_str()),
            yolo: self.yolo,
        }
    }

    pub fn command_for<'a>(&'a self, provider: &'a dyn Provider) -> &'a str {
        self.command.as_deref().unwrap_or(provider.default_command())
    }

    pub fn reviewer_command_for<'a>(&'a self, provider: &'a dyn Provider) -> &'a str {
        self.reviewer_command
            .as_deref()
            .unwrap_or(provider.default_command())
    }
}

/// CLI-sourced overrides; None means the flag was not given.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub provider: Option<String>,
    pub reviewer_provider: Option<String>,
    pub prompt: Option<PathBuf>,
    pub reviewer_prompt: Option<PathBuf>,
    pub iterations: Option<u32>,
    pub preview: Option<usize>,
    pub parallel: Option<u16>,
    pub pause_ms: Option<u64>,
    pub command: Option<String>,
    pub reviewer_command: Option<String>,
    pub model: Option<String>,
    pub reviewer_model: Option<String>,
    pub reasoning_effort: Option<ReasoningEffort>,
    pub yolo: Option<bool>,
    pub log_dir: Option<PathBuf>,
    pub show_raw: bool,
    pub review: Option<bool>,
    pub review_max_fix_attempts: Option<u32>,
    pub bead_mode: Option<BeadMode>,
    pub top_level_bead: Option<String>,
    pub theme: Option<String>,
}

/// File-sourced configuration; both files share this schema.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    pub provider: Option<String>,
    pub reviewer_provider: Option<String>,
    pub developer_prompt: Option<PathBuf>,
    pub reviewer_prompt: Option<PathBuf>,
    pub iterations: Option<u32>,
    pub preview: Option<usize>,
    pub parallel: Option<u16>,
    pub pause_ms: Option<u64>,
    pub command: Option<String>,
    pub reviewer_command: Option<String>,
    pub model: Option<String>,
    pub reviewer_model: Option<String>,
    pub reasoning_effort: Option<ReasoningEffort>,
    pub yolo: Option<bool>,
    pub log_dir: Option<PathBuf>,
    pub show_raw: Option<bool>,
    pub review: Option<bool>,
    pub review_max_fix_attempts: Option<u32>,
    pub bead_mode: Option<BeadMode>,
    pub top_level_bead: Option<String>,
    pub theme: Option<String>,
}

/// Load `<HOME>/.ouroboros/config.toml` deep-merged under
/// `<project>/.ouroboros/config.toml`.
pub fn load_file_config(project_root: &Path) -> Result<FileConfig> {
    let global = fsutil::user_config_dir()
        .ok()
        .map(|dir| dir.join("config.toml"));
    let project = fsutil::project_config_dir(project_root).join("config.toml");

    let mut merged = toml::Value::Table(toml::map::Map::new());
    if let Some(global) = global {
        if let Some(value) = read_toml(&global)? {
            merge_toml(&mut merged, value);
        }
    }
    if let Some(value) = read_toml(&project)? {
        merge_toml(&mut merged, value);
    }

    merged
        .try_into()
        .context("failed to interpret merged configuration")
}

fn read_toml(path: &Path) -> Result<Option<toml::Value>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read config {}", path.display()))
        }
    };
    let value = toml::from_str(&text)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(value))
}

/// Recursive table merge; overlay wins on leaf conflicts.
fn merge_toml(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_value) in overlay_table {
                let nested = overlay_value.is_table()
                    && base_table.get(&key).is_some_and(toml::Value::is_table);
                if nested {
                    if let Some(base_value) = base_table.get_mut(&key) {
                        merge_toml(base_value, overlay_value);
                    }
                } else {
                    base_table.insert(key, overlay_value);
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Apply precedence, discover prompt files, and fail fast on anything the
/// loop could not recover from later.
pub fn resolve_options(
    project_root: &Path,
    cli: CliOverrides,
    file: FileConfig,
) -> Result<CliOptions> {
    let defaults = CliOptions::default();

    let provider = cli
        .provider
        .or(file.provider)
        .unwrap_or_else(|| defaults.provider.clone());
    providers::provider_by_name(&provider)?;

    let reviewer_provider = cli
        .reviewer_provider
        .or(file.reviewer_provider)
        .unwrap_or_else(|| provider.clone());
    providers::provider_by_name(&reviewer_provider)?;

    let iterations_set = cli.iterations.is_some();
    let iteration_limit = cli
        .iterations
        .or(file.iterations)
        .unwrap_or(defaults.iteration_limit);
    if iteration_limit == 0 {
        return Err(anyhow!("--iterations must be a positive integer"));
    }

    let parallel_agents = cli
        .parallel
        .or(file.parallel)
        .unwrap_or(defaults.parallel_agents);
    if parallel_agents == 0 {
        return Err(anyhow!("--parallel must be a positive integer"));
    }

    let preview_lines = cli
        .preview
        .or(file.preview)
        .unwrap_or(defaults.preview_lines);
    if preview_lines == 0 {
        return Err(anyhow!("--preview must be a positive integer"));
    }

    let review_max_fix_attempts = cli
        .review_max_fix_attempts
        .or(file.review_max_fix_attempts)
        .unwrap_or(defaults.review_max_fix_attempts);
    if review_max_fix_attempts == 0 {
        return Err(anyhow!("--review-max-fix-attempts must be a positive integer"));
    }

    let bead_mode = cli.bead_mode.or(file.bead_mode).unwrap_or(defaults.bead_mode);
    let top_level_task_id = cli.top_level_bead.or(file.top_level_bead);
    if bead_mode == BeadMode::TopLevel && top_level_task_id.is_none() {
        return Err(anyhow!("--bead-mode top-level requires --top-level-bead <id>"));
    }

    let developer_prompt_path = discover_prompt(
        project_root,
        cli.prompt.or(file.developer_prompt),
        "developer-prompt.md",
    )?
    .ok_or_else(|| {
        anyhow!(
            "no developer prompt found; pass --prompt or create {}",
            fsutil::project_config_dir(project_root)
                .join("developer-prompt.md")
                .display()
        )
    })?;

    let review_enabled = cli.review.or(file.review).unwrap_or(defaults.review_enabled);
    let reviewer_prompt_path = discover_prompt(
        project_root,
        cli.reviewer_prompt.or(file.reviewer_prompt),
        "reviewer-prompt.md",
    )?;
    if review_enabled && reviewer_prompt_path.is_none() {
        return Err(anyhow!(
            "--review requires a reviewer prompt; pass --reviewer-prompt or create {}",
            fsutil::project_config_dir(project_root)
                .join("reviewer-prompt.md")
                .display()
        ));
    }

    let theme_name = cli.theme.or(file.theme);
    let theme = match theme_name {
        Some(name) => Theme::resolve(&name)?,
        None => defaults.theme,
    };

    let log_dir = cli
        .log_dir
        .or(file.log_dir)
        .unwrap_or_else(|| fsutil::project_meta_dir(project_root).join("logs"));

    Ok(CliOptions {
        provider,
        reviewer_provider,
        iteration_limit,
        iterations_set,
        parallel_agents,
        preview_lines,
        pause_ms: cli.pause_ms.or(file.pause_ms).unwrap_or(defaults.pause_ms),
        command: cli.command.or(file.command),
        reviewer_command: cli.reviewer_command.or(file.reviewer_command),
        model: cli.model.or(file.model),
        reviewer_model: cli.reviewer_model.or(file.reviewer_model),
        reasoning_effort: cli.reasoning_effort.or(file.reasoning_effort),
        yolo: cli.yolo.or(file.yolo).unwrap_or(defaults.yolo),
        log_dir,
        developer_prompt_path,
        reviewer_prompt_path,
        review_enabled,
        review_max_fix_attempts,
        bead_mode,
        top_level_task_id,
        show_raw: cli.show_raw || file.show_raw.unwrap_or(false),
        theme,
    })
}

/// Explicit path wins (and must exist); otherwise probe the project config
/// dir, then the user config dir.
fn discover_prompt(
    project_root: &Path,
    explicit: Option<PathBuf>,
    file_name: &str,
) -> Result<Option<PathBuf>> {
    if let Some(path) = explicit {
        if !path.exists() {
            return Err(anyhow!("missing prompt file: {}", path.display()));
        }
        return Ok(Some(path));
    }

    let project_candidate = fsutil::project_config_dir(project_root).join(file_name);
    if project_candidate.exists() {
        return Ok(Some(project_candidate));
    }
    if let Ok(user_dir) = fsutil::user_config_dir() {
        let user_candidate = user_dir.join(file_name);
        if user_candidate.exists() {
            return Ok(Some(user_candidate));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    fn project_with_prompt() -> (tempfile::TempDir, CliOverrides) {
        let dir = tempdir().unwrap();
        let prompt = dir.path().join("prompt.md");
        std::fs::write(&prompt, "implement the next task\n").unwrap();
        let cli = CliOverrides {
            prompt: Some(prompt),
            ..CliOverrides::default()
        };
        (dir, cli)
    }

    #[test]
    fn merge_prefers_overlay_leaves() {
        let mut base: toml::Value = toml::from_str("provider = \"codex\"\npreview = 3").unwrap();
        let overlay: toml::Value = toml::from_str("preview = 9").unwrap();
        merge_toml(&mut base, overlay);

        let merged: FileConfig = base.try_into().unwrap();
        assert_eq!(merged.provider.as_deref(), Some("codex"));
        assert_eq!(merged.preview, Some(9));
    }

    #[test]
    fn cli_beats_file_config() {
        let (dir, mut cli) = project_with_prompt();
        cli.iterations = Some(4);
        cli.model = Some("cli-model".to_string());
        let file = FileConfig {
            iterations: Some(99),
            model: Some("file-model".to_string()),
            parallel: Some(2),
            ..FileConfig::default()
        };

        let options = resolve_options(dir.path(), cli, file).unwrap();
        assert_eq!(options.iteration_limit, 4);
        assert!(options.iterations_set);
        assert_eq!(options.model.as_deref(), Some("cli-model"));
        assert_eq!(options.parallel_agents, 2);
    }

    #[test]
    fn reviewer_provider_defaults_to_primary() {
        let (dir, mut cli) = project_with_prompt();
        cli.provider = Some("claude".to_string());

        let options = resolve_options(dir.path(), cli, FileConfig::default()).unwrap();
        assert_eq!(options.reviewer_provider, "claude");
    }

    #[test]
    fn unknown_provider_fails_fast() {
        let (dir, mut cli) = project_with_prompt();
        cli.provider = Some("mystery".to_string());
        assert!(resolve_options(dir.path(), cli, FileConfig::default()).is_err());
    }

    #[test]
    fn top_level_mode_requires_an_id() {
        let (dir, mut cli) = project_with_prompt();
        cli.bead_mode = Some(BeadMode::TopLevel);
        let err = resolve_options(dir.path(), cli, FileConfig::default()).unwrap_err();
        assert!(err.to_string().contains("--top-level-bead"));
    }

    #[test]
    fn review_requires_a_reviewer_prompt() {
        let (dir, mut cli) = project_with_prompt();
        cli.review = Some(true);
        let err = resolve_options(dir.path(), cli, FileConfig::default()).unwrap_err();
        assert!(err.to_string().contains("reviewer prompt"));
    }

    #[test]
    fn missing_explicit_prompt_is_an_error() {
        let dir = tempdir().unwrap();
        let cli = CliOverrides {
            prompt: Some(dir.path().join("nope.md")),
            ..CliOverrides::default()
        };
        let err = resolve_options(dir.path(), cli, FileConfig::default()).unwrap_err();
        assert!(err.to_string().contains("missing prompt file"));
    }

    #[test]
    fn project_prompt_is_discovered() {
        let dir = tempdir().unwrap();
        let config_dir = dir.path().join(".ouroboros");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(config_dir.join("developer-prompt.md"), "go\n").unwrap();

        let options =
            resolve_options(dir.path(), CliOverrides::default(), FileConfig::default()).unwrap();
        assert_eq!(
            options.developer_prompt_path,
            config_dir.join("developer-prompt.md")
        );
    }

    #[test]
    fn zero_valued_counters_are_rejected() {
        let (dir, mut cli) = project_with_prompt();
        cli.parallel = Some(0);
        assert!(resolve_options(dir.path(), cli, FileConfig::default()).is_err());
    }
}
