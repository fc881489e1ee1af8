use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde_json::Value;
use tokio::process::Command;

use crate::tracker::{
    sort_remaining, Task, TaskSnapshot, STATUS_BLOCKED, STATUS_CLOSED, STATUS_DEFERRED,
    STATUS_IN_PROGRESS, STATUS_OPEN,
};

const TRACKER_TIMEOUT: Duration = Duration::from_secs(10);

/// Load the current tracker issue set. Never fails: tracker errors come back
/// as an unavailable snapshot with a diagnostic.
pub async fn load_snapshot(project_root: &Path, top_level_task_id: Option<&str>) -> TaskSnapshot {
    let attempts: [(&str, &[&str]); 2] = [
        ("tsq", &["list", "--json"]),
        ("bd", &["list", "--json", "--all"]),
    ];

    let mut last_error = String::new();
    for (binary, args) in attempts {
        match run_tracker(project_root, binary, args).await {
            Ok(stdout) => {
                return match parse_records(&stdout) {
                    Ok(records) => build_snapshot(binary, records, top_level_task_id),
                    Err(reason) => TaskSnapshot::unavailable(binary, reason),
                };
            }
            Err(reason) => last_error = reason,
        }
    }

    TaskSnapshot::unavailable("tracker", last_error)
}

async fn run_tracker(project_root: &Path, binary: &str, args: &[&str]) -> Result<String, String> {
    let output = tokio::time::timeout(
        TRACKER_TIMEOUT,
        Command::new(binary)
            .args(args)
            .current_dir(project_root)
            .output(),
    )
    .await;

    match output {
        Ok(Ok(output)) if output.status.success() => {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        }
        Ok(Ok(output)) => Err(format!(
            "{binary} exited with status {}: {}",
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).trim()
        )),
        Ok(Err(err)) => Err(format!("failed to launch {binary}: {err}")),
        Err(_) => Err(format!(
            "{binary} timed out after {}s",
            TRACKER_TIMEOUT.as_secs()
        )),
    }
}

fn parse_records(stdout: &str) -> Result<Vec<Value>, String> {
    let value: Value = serde_json::from_str(stdout.trim())
        .map_err(|err| format!("unparseable tracker JSON: {err}"))?;

    let records = match value {
        Value::Array(items) => items,
        Value::Object(map) => {
            let nested = ["issues", "tasks", "beads"]
                .iter()
                .find_map(|key| map.get(*key).and_then(Value::as_array).cloned());
            match nested {
                Some(items) => items,
                None => return Err("tracker JSON object has no issue array".to_string()),
            }
        }
        other => return Err(format!("unexpected tracker JSON shape: {other}")),
    };

    Ok(records)
}

fn build_snapshot(
    source: &str,
    records: Vec<Value>,
    top_level_task_id: Option<&str>,
) -> TaskSnapshot {
    let mut by_id = BTreeMap::new();

    for record in &records {
        let Some(task) = normalize_record(record) else {
            continue;
        };
        if let Some(parent) = top_level_task_id {
            if record_parent_id(record).as_deref() != Some(parent) {
                continue;
            }
        }
        by_id.insert(task.id.clone(), task);
    }

    let mut snapshot = TaskSnapshot {
        available: true,
        source: source.to_string(),
        ..TaskSnapshot::default()
    };

    snapshot.total = by_id.len();
    for task in by_id.values() {
        match task.status.as_str() {
            STATUS_OPEN => snapshot.open += 1,
            STATUS_IN_PROGRESS => snapshot.in_progress += 1,
            STATUS_BLOCKED => snapshot.blocked += 1,
            STATUS_CLOSED => snapshot.closed += 1,
            STATUS_DEFERRED => snapshot.deferred += 1,
            _ => {}
        }
    }

    let mut remaining: Vec<Task> = by_id
        .values()
        .filter(|task| !task.is_closed())
        .cloned()
        .collect();
    sort_remaining(&mut remaining);
    snapshot.remaining = remaining.len();
    snapshot.remaining_issues = remaining;
    snapshot.by_id = by_id;
    snapshot
}

/// Accepts `id|issue_id|key` and `title|summary|name` aliases; records
/// lacking an id or title are dropped.
fn normalize_record(record: &Value) -> Option<Task> {
    let id = string_field(record, &["id", "issue_id", "key"])?;
    let title = string_field(record, &["title", "summary", "name"])?;

    let status = record
        .get("status")
        .and_then(Value::as_str)
        .map(|status| status.trim().to_lowercase())
        .filter(|status| !status.is_empty())
        .unwrap_or_else(|| STATUS_OPEN.to_string());

    let priority = record.get("priority").and_then(Value::as_i64);
    let assignee = string_field(record, &["assignee"]);

    Some(Task {
        id,
        title,
        status,
        priority,
        assignee,
    })
}

fn record_parent_id(record: &Value) -> Option<String> {
    string_field(record, &["parent_id", "parent"])
}

fn string_field(record: &Value, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| record.get(*name).and_then(Value::as_str))
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
