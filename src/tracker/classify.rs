use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::tracker::Task;

const ID_PATTERN: &str = r"[a-z][a-z0-9]*(?:-[a-z0-9.]+)+";

/// Explicit-pick markers, in precedence order. The first pattern that yields
/// any known id decides the result.
static EXPLICIT_PICKS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        format!(r"(?i)updated issue:\s*({ID_PATTERN})"),
        format!(r"(?i)updated task:\s*({ID_PATTERN})"),
        format!(r"(?i)\btsq\s+update\s+({ID_PATTERN})"),
        format!(r"(?i)\bbd\s+update\s+({ID_PATTERN})"),
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("explicit-pick pattern must compile"))
    .collect()
});

static GENERIC_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!("(?i){ID_PATTERN}")).expect("id pattern must compile"));

/// Return the task ids the text refers to, scoped to `known_ids`.
///
/// Explicit ceremony markers win; free text mentioning several known ids is
/// intentionally ambiguous and yields nothing.
pub fn extract_referenced_task_ids(text: &str, known_ids: &BTreeMap<String, Task>) -> Vec<String> {
    for pattern in EXPLICIT_PICKS.iter() {
        let mut picks = Vec::new();
        for capture in pattern.captures_iter(text) {
            let id = capture[1].to_lowercase();
            if known_ids.contains_key(&id) && !picks.contains(&id) {
                picks.push(id);
            }
        }
        if !picks.is_empty() {
            return picks;
        }
    }

    let mut mentioned = Vec::new();
    for matched in GENERIC_ID.find_iter(text) {
        let id = matched.as_str().to_lowercase();
        if known_ids.contains_key(&id) && !mentioned.contains(&id) {
            mentioned.push(id);
        }
    }

    if mentioned.len() == 1 {
        mentioned
    } else {
        Vec::new()
    }
}
