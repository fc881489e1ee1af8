use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use crate::engine::shutdown::ShutdownGuard;

const READ_CHUNK_SIZE: usize = 8192;

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("executable '{command}' not found on PATH; expected something like `{hint}`")]
    NotFound { command: String, hint: String },
    #[error("failed to launch '{command}': {source}")]
    Launch {
        command: String,
        source: std::io::Error,
    },
}

/// Outcome of one streamed child process. `status` is None iff the child was
/// killed by a signal.
#[derive(Debug, Clone, Default)]
pub struct StreamResult {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl StreamResult {
    pub fn succeeded(&self) -> bool {
        self.status == Some(0)
    }

    /// Combined stdout and stderr, the form the classifier and the
    /// aggregator operate on.
    pub fn combined_output(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr).trim().to_string()
    }
}

pub struct ProcessSpec<'a> {
    pub prompt: &'a str,
    pub command: &'a str,
    pub args: &'a [String],
    pub cwd: &'a Path,
    pub log_path: &'a Path,
    pub show_raw: bool,
    pub command_hint: String,
}

/// Resolve `command` the way a shell would: absolute and directory-qualified
/// names pass through, bare names go through the PATH lookup (PATHEXT probing
/// included on Windows).
pub fn resolve_command(command: &str, hint: &str) -> Result<PathBuf, SpawnError> {
    let as_path = Path::new(command);
    if as_path.is_absolute() || command.contains(std::path::MAIN_SEPARATOR) {
        return Ok(as_path.to_path_buf());
    }
    which::which(command).map_err(|_| SpawnError::NotFound {
        command: command.to_string(),
        hint: hint.to_string(),
    })
}

/// Spawn one agent child, deliver the prompt on stdin, stream stdout
/// line-by-line, and append every output chunk verbatim to the JSONL log.
///
/// `on_stdout_line` fires for each complete `\r?\n`-terminated line (and once
/// for a trailing partial at close); `on_first_response` fires exactly once,
/// on the first non-whitespace stdout chunk.
pub async fn run_agent_process(
    spec: ProcessSpec<'_>,
    guard: &ShutdownGuard,
    mut on_stdout_line: impl FnMut(&str),
    mut on_first_response: impl FnMut(),
) -> Result<StreamResult> {
    let resolved = resolve_command(spec.command, &spec.command_hint)?;

    let mut child = Command::new(&resolved)
        .args(spec.args)
        .current_dir(spec.cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| SpawnError::Launch {
            command: spec.command.to_string(),
            source,
        })?;

    let pid = child.id();
    if let Some(pid) = pid {
        guard.track_child(pid);
    }

    if let Some(mut stdin) = child.stdin.take() {
        // A child that closes stdin early must not sink the run.
        let _ = stdin.write_all(spec.prompt.as_bytes()).await;
        let _ = stdin.shutdown().await;
    }

    let mut stdout_pipe = child
        .stdout
        .take()
        .context("child stdout pipe was not captured")?;
    let mut stderr_pipe = child
        .stderr
        .take()
        .context("child stderr pipe was not captured")?;

    let mut stdout = String::new();
    let mut stderr = String::new();

    let read_stdout = async {
        let mut carry = String::new();
        let mut responded = false;
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            let n = match stdout_pipe.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(_) => break,
            };
            let text = String::from_utf8_lossy(&chunk[..n]).into_owned();
            append_chunk(spec.log_path, &text);
            if !responded && !text.trim().is_empty() {
                responded = true;
                on_first_response();
            }
            stdout.push_str(&text);
            carry.push_str(&text);
            while let Some(newline) = carry.find('\n') {
                let rest = carry.split_off(newline + 1);
                let line = carry.trim_end_matches(['\n', '\r']).to_string();
                carry = rest;
                if spec.show_raw {
                    println!("{line}");
                }
                on_stdout_line(&line);
            }
        }
        if !carry.is_empty() {
            if spec.show_raw {
                println!("{carry}");
            }
            on_stdout_line(&carry);
        }
    };

    let read_stderr = async {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            let n = match stderr_pipe.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(_) => break,
            };
            let text = String::from_utf8_lossy(&chunk[..n]).into_owned();
            append_chunk(spec.log_path, &text);
            stderr.push_str(&text);
        }
    };

    tokio::join!(read_stdout, read_stderr);

    let status = child
        .wait()
        .await
        .context("failed waiting for agent process")?;
    if let Some(pid) = pid {
        guard.untrack_child(pid);
    }

    Ok(StreamResult {
        status: status.code(),
        stdout,
        stderr,
    })
}

/// Verbatim append with one retry after recreating a missing parent
/// directory.
fn append_chunk(log_path: &Path, text: &str) {
    use std::io::Write;

    for attempt in 0..2 {
        let opened = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path);
        match opened {
            Ok(mut file) => {
                let _ = file.write_all(text.as_bytes());
                return;
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound && attempt == 0 => {
                if let Some(parent) = log_path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
            }
            Err(_) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    fn spec<'a>(
        command: &'a str,
        args: &'a [String],
        cwd: &'a Path,
        log_path: &'a Path,
    ) -> ProcessSpec<'a> {
        ProcessSpec {
            prompt: "",
            command,
            args,
            cwd,
            log_path,
            show_raw: false,
            command_hint: command.to_string(),
        }
    }

    #[test]
    fn unknown_bare_command_is_a_spawn_error() {
        let err = resolve_command("definitely-not-a-real-binary-xyz", "hint").unwrap_err();
        assert!(matches!(err, SpawnError::NotFound { .. }));
    }

    #[test]
    fn qualified_paths_skip_resolution() {
        let path = resolve_command("/no/such/dir/tool", "hint").unwrap();
        assert_eq!(path, PathBuf::from("/no/such/dir/tool"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn streams_lines_and_logs_chunks() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("logs").join("agent.jsonl");
        let args = vec![
            "-c".to_string(),
            "printf 'one\\ntwo\\r\\n'; printf 'tail-no-newline'; echo err >&2".to_string(),
        ];

        let guard = ShutdownGuard::new();
        let mut lines = Vec::new();
        let mut first = 0;
        let result = run_agent_process(
            spec("sh", &args, dir.path(), &log_path),
            &guard,
            |line| lines.push(line.to_string()),
            || first += 1,
        )
        .await
        .unwrap();

        assert_eq!(result.status, Some(0));
        assert_eq!(lines, ["one", "two", "tail-no-newline"]);
        assert_eq!(first, 1);

        // stdout and stderr chunks interleave in the log, but each stream's
        // own content arrives verbatim and in order.
        let logged = std::fs::read_to_string(&log_path).unwrap();
        assert!(logged.contains("one"));
        assert!(logged.contains("two\r\n"));
        assert!(logged.contains("tail-no-newline"));
        assert!(logged.contains("err"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn prompt_arrives_on_stdin() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("agent.jsonl");
        let args = vec!["-c".to_string(), "cat".to_string()];

        let guard = ShutdownGuard::new();
        let mut lines = Vec::new();
        let mut process_spec = spec("sh", &args, dir.path(), &log_path);
        process_spec.prompt = "hello agent\n";
        let result = run_agent_process(
            process_spec,
            &guard,
            |line| lines.push(line.to_string()),
            || {},
        )
        .await
        .unwrap();

        assert!(result.succeeded());
        assert_eq!(lines, ["hello agent"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_is_reported_not_an_error() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("agent.jsonl");
        let args = vec!["-c".to_string(), "echo boom >&2; exit 3".to_string()];

        let guard = ShutdownGuard::new();
        let result = run_agent_process(
            spec("sh", &args, dir.path(), &log_path),
            &guard,
            |_| {},
            || {},
        )
        .await
        .unwrap();

        assert_eq!(result.status, Some(3));
        assert!(result.stderr.contains("boom"));
        assert!(result.combined_output().contains("boom"));
    }
}
