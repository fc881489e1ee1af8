use std::collections::BTreeMap;

pub mod classify;
pub mod snapshot;

pub const STATUS_OPEN: &str = "open";
pub const STATUS_IN_PROGRESS: &str = "in_progress";
pub const STATUS_BLOCKED: &str = "blocked";
pub const STATUS_CLOSED: &str = "closed";
pub const STATUS_DEFERRED: &str = "deferred";

/// One tracker issue, read-only within an iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub status: String,
    pub priority: Option<i64>,
    pub assignee: Option<String>,
}

impl Task {
    pub fn is_closed(&self) -> bool {
        self.status == STATUS_CLOSED
    }
}

/// The tracker's issue set as observed at the start of one iteration.
/// Never mutated after construction.
#[derive(Debug, Clone, Default)]
pub struct TaskSnapshot {
    pub available: bool,
    pub source: String,
    pub total: usize,
    pub remaining: usize,
    pub open: usize,
    pub in_progress: usize,
    pub blocked: usize,
    pub closed: usize,
    pub deferred: usize,
    pub remaining_issues: Vec<Task>,
    pub by_id: BTreeMap<String, Task>,
    pub error: Option<String>,
}

impl TaskSnapshot {
    pub fn unavailable(source: &str, error: impl Into<String>) -> Self {
        Self {
            available: false,
            source: source.to_string(),
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Remaining-issue order: priority descending (missing = -1), then id
/// ascending.
pub fn sort_remaining(tasks: &mut [Task]) {
    tasks.sort_by(|a, b| {
        let pa = a.priority.unwrap_or(-1);
        let pb = b.priority.unwrap_or(-1);
        pb.cmp(&pa).then_with(|| a.id.cmp(&b.id))
    });
}
