use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

mod config;
mod engine;
mod fsutil;
mod providers;
mod render;
mod tracker;

use crate::config::{BeadMode, CliOverrides, ReasoningEffort};
use crate::engine::controller::{self, RunContext};
use crate::engine::shutdown::ShutdownGuard;
use crate::render::{ConsoleReporter, NullReporter, Reporter};

#[derive(Debug, Parser)]
#[command(name = "ouroboros")]
#[command(about = "Supervisory loop that drives AI coding-agent CLIs against a task tracker")]
struct Cli {
    #[arg(long, help = "Implementer adapter name (codex, claude)")]
    provider: Option<String>,

    #[arg(long, help = "Reviewer adapter name; defaults to the primary provider")]
    reviewer_provider: Option<String>,

    #[arg(
        short = 'p',
        long = "prompt",
        visible_alias = "developer-prompt",
        help = "Implementer prompt file"
    )]
    prompt: Option<PathBuf>,

    #[arg(long, help = "Reviewer prompt file; required with --review")]
    reviewer_prompt: Option<PathBuf>,

    #[arg(short = 'n', long, help = "Maximum loop iterations")]
    iterations: Option<u32>,

    #[arg(short = 'l', long, help = "Preview lines shown per agent")]
    preview: Option<usize>,

    #[arg(short = 'P', long, help = "Parallel agent slots; 1 disables staged launch")]
    parallel: Option<u16>,

    #[arg(long, help = "Pause between iterations, in milliseconds")]
    pause_ms: Option<u64>,

    #[arg(short = 'c', long, help = "Implementer executable")]
    command: Option<String>,

    #[arg(long, help = "Reviewer executable")]
    reviewer_command: Option<String>,

    #[arg(short = 'm', long, help = "Model id passed to the implementer")]
    model: Option<String>,

    #[arg(long, help = "Model id passed to the reviewer")]
    reviewer_model: Option<String>,

    #[arg(long, value_enum, help = "Reasoning effort passed to the agent")]
    reasoning_effort: Option<ReasoningEffort>,

    #[arg(long, overrides_with = "no_yolo", help = "Disable agent approvals and sandboxing")]
    yolo: bool,

    #[arg(long = "no-yolo", overrides_with = "yolo", help = "Keep agent sandboxing enabled")]
    no_yolo: bool,

    #[arg(long, help = "Log root directory")]
    log_dir: Option<PathBuf>,

    #[arg(long, help = "Stream raw child output instead of the rich renderer")]
    show_raw: bool,

    #[arg(long, overrides_with = "no_review", help = "Enable the review/fix sub-loop")]
    review: bool,

    #[arg(long = "no-review", overrides_with = "review", help = "Disable the review/fix sub-loop")]
    no_review: bool,

    #[arg(long, help = "Fix attempts allowed per reviewed slot")]
    review_max_fix_attempts: Option<u32>,

    #[arg(long, value_enum, help = "Task scope mode")]
    bead_mode: Option<BeadMode>,

    #[arg(long, help = "Top-level task id; required with --bead-mode top-level")]
    top_level_bead: Option<String>,

    #[arg(long, help = "UI theme name or theme file path")]
    theme: Option<String>,
}

impl Cli {
    fn into_overrides(self) -> CliOverrides {
        let yolo = flag_pair(self.yolo, self.no_yolo);
        let review = flag_pair(self.review, self.no_review);
        CliOverrides {
            provider: self.provider,
            reviewer_provider: self.reviewer_provider,
            prompt: self.prompt,
            reviewer_prompt: self.reviewer_prompt,
            iterations: self.iterations,
            preview: self.preview,
            parallel: self.parallel,
            pause_ms: self.pause_ms,
            command: self.command,
            reviewer_command: self.reviewer_command,
            model: self.model,
            reviewer_model: self.reviewer_model,
            reasoning_effort: self.reasoning_effort,
            yolo,
            log_dir: self.log_dir,
            show_raw: self.show_raw,
            review,
            review_max_fix_attempts: self.review_max_fix_attempts,
            bead_mode: self.bead_mode,
            top_level_bead: self.top_level_bead,
            theme: self.theme,
        }
    }
}

fn flag_pair(on: bool, off: bool) -> Option<bool> {
    if on {
        Some(true)
    } else if off {
        Some(false)
    } else {
        None
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let project_root = std::env::current_dir().context("failed to resolve working directory")?;
    let file = config::load_file_config(&project_root)?;
    let options = Arc::new(config::resolve_options(
        &project_root,
        cli.into_overrides(),
        file,
    )?);

    let implementer = providers::provider_by_name(&options.provider)?;
    let reviewer = providers::provider_by_name(&options.reviewer_provider)?;

    let reporter: Arc<dyn Reporter> = if options.show_raw {
        Arc::new(NullReporter)
    } else {
        Arc::new(ConsoleReporter::new(options.theme, options.preview_lines))
    };

    let guard = ShutdownGuard::new();
    guard.install(reporter.clone());

    let result = controller::run_loop(RunContext {
        project_root,
        options,
        implementer,
        reviewer,
        guard: guard.clone(),
        reporter,
    })
    .await;

    guard.finalize();
    result
}
