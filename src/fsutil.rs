use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

pub fn project_meta_dir(project_root: &Path) -> PathBuf {
    project_root.join(".ai_agents")
}

pub fn project_config_dir(project_root: &Path) -> PathBuf {
    project_root.join(".ouroboros")
}

pub fn user_config_dir() -> Result<PathBuf> {
    let home_dir = dirs::home_dir().context("Could not find home directory")?;
    Ok(home_dir.join(".ouroboros"))
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("failed to create directory: {}", path.display()))
}

pub fn read_to_string(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("failed to read file: {}", path.display()))
}

#[allow(dead_code)]
pub fn write_string(path: &Path, content: impl AsRef<str>) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    std::fs::write(path, content.as_ref().as_bytes())
        .with_context(|| format!("failed to write file: {}", path.display()))
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let tmp = path.with_extension("tmp");
    let bytes = serde_json::to_vec_pretty(value)?;
    std::fs::write(&tmp, bytes).with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to move {} to {}", tmp.display(), path.display()))?;
    Ok(())
}

pub fn append_text(path: &Path, text: &str) -> Result<()> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.write_all(text.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    #[test]
    fn project_dirs_are_under_project_root() {
        let dir = tempdir().unwrap();
        let root = dir.path();

        assert_eq!(project_meta_dir(root), root.join(".ai_agents"));
        assert_eq!(project_config_dir(root), root.join(".ouroboros"));
    }

    #[test]
    fn ensure_dir_is_idempotent() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a").join("b");

        ensure_dir(&nested).unwrap();
        ensure_dir(&nested).unwrap();
        assert!(nested.exists());
    }

    #[test]
    fn write_and_read_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("file.txt");

        write_string(&path, "hello\n").unwrap();
        let content = read_to_string(&path).unwrap();
        assert_eq!(content, "hello\n");
    }

    #[test]
    fn append_text_accumulates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.txt");

        append_text(&path, "one\n").unwrap();
        append_text(&path, "two\n").unwrap();
        assert_eq!(read_to_string(&path).unwrap(), "one\ntwo\n");
    }

    #[test]
    fn write_json_atomic_replaces_existing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        write_json_atomic(&path, &serde_json::json!({"n": 1})).unwrap();
        write_json_atomic(&path, &serde_json::json!({"n": 2})).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["n"], 2);
        assert!(!path.with_extension("tmp").exists());
    }
}
