use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

/// Filename-safe ISO-8601 stamp shared by every artifact of one iteration.
pub fn iteration_stamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%dT%H%M%SZ").to_string()
}

/// Derives the per-slot artifact paths for one iteration:
/// `iter-<NNN>-<ISO8601>-agent-<MM>` plus a suffix per artifact kind.
#[derive(Debug, Clone)]
pub struct RunPaths {
    run_dir: PathBuf,
    stem: String,
}

impl RunPaths {
    pub fn new(run_dir: &Path, iteration: u32, stamp: &str, agent_id: u16) -> Self {
        Self {
            run_dir: run_dir.to_path_buf(),
            stem: format!("iter-{iteration:03}-{stamp}-agent-{agent_id:02}"),
        }
    }

    fn file(&self, suffix: &str) -> PathBuf {
        self.run_dir.join(format!("{}{}", self.stem, suffix))
    }

    pub fn jsonl_log(&self) -> PathBuf {
        self.file(".jsonl")
    }

    pub fn last_message(&self) -> PathBuf {
        self.file(".last-message.txt")
    }

    pub fn review_log(&self, attempt: u32) -> PathBuf {
        self.file(&format!("-review-{attempt}.jsonl"))
    }

    pub fn review_last_message(&self, attempt: u32) -> PathBuf {
        self.file(&format!("-review-{attempt}.last-message.txt"))
    }

    pub fn fix_log(&self, attempt: u32) -> PathBuf {
        self.file(&format!("-fix-{attempt}.jsonl"))
    }

    pub fn fix_last_message(&self, attempt: u32) -> PathBuf {
        self.file(&format!("-fix-{attempt}.last-message.txt"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::TimeZone;

    #[test]
    fn stamp_is_filename_safe() {
        let at = Utc.with_ymd_and_hms(2026, 8, 1, 10, 15, 0).unwrap();
        assert_eq!(iteration_stamp(at), "20260801T101500Z");
    }

    #[test]
    fn paths_follow_the_layout() {
        let paths = RunPaths::new(Path::new("/logs/run-x"), 7, "20260801T101500Z", 2);

        assert_eq!(
            paths.jsonl_log(),
            Path::new("/logs/run-x/iter-007-20260801T101500Z-agent-02.jsonl")
        );
        assert_eq!(
            paths.last_message(),
            Path::new("/logs/run-x/iter-007-20260801T101500Z-agent-02.last-message.txt")
        );
        assert_eq!(
            paths.review_log(1),
            Path::new("/logs/run-x/iter-007-20260801T101500Z-agent-02-review-1.jsonl")
        );
        assert_eq!(
            paths.fix_log(2),
            Path::new("/logs/run-x/iter-007-20260801T101500Z-agent-02-fix-2.jsonl")
        );
    }
}
