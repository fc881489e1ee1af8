use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::fsutil;

/// One running loop per project. The lock file carries the holder pid and is
/// removed on drop.
pub struct RunLock {
    lock_path: PathBuf,
}

impl RunLock {
    pub fn acquire(meta_dir: &Path) -> Result<Self> {
        fsutil::ensure_dir(meta_dir)?;
        let lock_path = meta_dir.join("ouroboros.lock");
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .with_context(|| {
                format!(
                    "could not acquire lock {} (another ouroboros run may be active)",
                    lock_path.display()
                )
            })?;
        writeln!(file, "pid={}", std::process::id())?;
        Ok(Self { lock_path })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.lock_path);
    }
}
