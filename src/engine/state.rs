use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::fsutil;

/// Persisted loop position. Rewritten atomically after every increment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IterationState {
    pub current_iteration: u32,
    pub max_iterations: u32,
}

impl IterationState {
    pub fn circuit_broken(&self) -> bool {
        self.current_iteration >= self.max_iterations
    }
}

pub fn state_path(project_root: &Path) -> PathBuf {
    fsutil::project_meta_dir(project_root).join("iteration.json")
}

/// Load the persisted state, or start fresh at zero. A persisted max is kept
/// unless the caller explicitly overrode the iteration budget.
pub fn load_or_init(path: &Path, iteration_limit: u32, iterations_set: bool) -> Result<IterationState> {
    let mut state = match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice::<IterationState>(&bytes)
            .with_context(|| format!("failed to parse {}", path.display()))?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => IterationState {
            current_iteration: 0,
            max_iterations: iteration_limit,
        },
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()))
        }
    };

    if iterations_set || state.max_iterations == 0 {
        state.max_iterations = iteration_limit;
    }
    state.max_iterations = state.max_iterations.max(1);

    Ok(state)
}

pub fn persist(path: &Path, state: &IterationState) -> Result<()> {
    fsutil::write_json_atomic(path, state)
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    #[test]
    fn starts_fresh_when_missing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("iteration.json");

        let state = load_or_init(&path, 10, false).unwrap();
        assert_eq!(state.current_iteration, 0);
        assert_eq!(state.max_iterations, 10);
        assert!(!state.circuit_broken());
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("iteration.json");

        let written = IterationState {
            current_iteration: 3,
            max_iterations: 7,
        };
        persist(&path, &written).unwrap();

        let loaded = load_or_init(&path, 99, false).unwrap();
        assert_eq!(loaded, written);
    }

    #[test]
    fn explicit_limit_overrides_persisted_max() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("iteration.json");

        persist(
            &path,
            &IterationState {
                current_iteration: 2,
                max_iterations: 5,
            },
        )
        .unwrap();

        let loaded = load_or_init(&path, 20, true).unwrap();
        assert_eq!(loaded.current_iteration, 2);
        assert_eq!(loaded.max_iterations, 20);
    }

    #[test]
    fn circuit_breaks_at_max() {
        let state = IterationState {
            current_iteration: 4,
            max_iterations: 4,
        };
        assert!(state.circuit_broken());
    }

    #[test]
    fn schema_uses_snake_case_keys() {
        let json = serde_json::to_string(&IterationState {
            current_iteration: 1,
            max_iterations: 2,
        })
        .unwrap();
        assert!(json.contains("\"current_iteration\":1"));
        assert!(json.contains("\"max_iterations\":2"));
    }
}
