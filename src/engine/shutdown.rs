use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::render::{Reporter, Tone};

const TERM_GRACE: Duration = Duration::from_millis(300);

/// Signal-driven termination: owns the live child set and the shutdown flag.
/// Cloned handles share the same underlying state.
#[derive(Clone)]
pub struct ShutdownGuard {
    inner: Arc<Inner>,
}

struct Inner {
    shutting_down: AtomicBool,
    finalized: AtomicBool,
    children: Mutex<HashSet<u32>>,
}

impl ShutdownGuard {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                shutting_down: AtomicBool::new(false),
                finalized: AtomicBool::new(false),
                children: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Register SIGINT/SIGTERM handling. On the first signal every tracked
    /// child is terminated and the process exits with the signal-derived
    /// code (130 interrupt, 143 terminate).
    pub fn install(&self, reporter: Arc<dyn Reporter>) {
        let guard = self.clone();
        let interrupt_reporter = reporter.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                guard.trigger("interrupt", 130, interrupt_reporter.as_ref()).await;
            }
        });

        #[cfg(not(unix))]
        drop(reporter);

        #[cfg(unix)]
        {
            let guard = self.clone();
            tokio::spawn(async move {
                let mut terminate = match tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::terminate(),
                ) {
                    Ok(signal) => signal,
                    Err(_) => return,
                };
                if terminate.recv().await.is_some() {
                    guard.trigger("terminate", 143, reporter.as_ref()).await;
                }
            });
        }
    }

    async fn trigger(&self, signal: &str, code: i32, reporter: &dyn Reporter) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        eprintln!("received {signal}, cleaning up…");
        reporter.stop(Tone::Warn);
        self.kill_tracked_children().await;
        std::process::exit(code);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    pub fn track_child(&self, pid: u32) {
        if let Ok(mut children) = self.inner.children.lock() {
            children.insert(pid);
        }
    }

    pub fn untrack_child(&self, pid: u32) {
        if let Ok(mut children) = self.inner.children.lock() {
            children.remove(&pid);
        }
    }

    #[cfg(test)]
    fn tracked_count(&self) -> usize {
        self.inner.children.lock().map(|c| c.len()).unwrap_or(0)
    }

    async fn kill_tracked_children(&self) {
        let pids: Vec<u32> = {
            let Ok(children) = self.inner.children.lock() else {
                return;
            };
            children.iter().copied().collect()
        };
        if pids.is_empty() {
            return;
        }

        terminate_all(&pids).await;

        if let Ok(mut children) = self.inner.children.lock() {
            children.clear();
        }
    }

    /// Idempotent normal-exit cleanup.
    pub fn finalize(&self) {
        if self.inner.finalized.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut children) = self.inner.children.lock() {
            children.clear();
        }
    }
}

impl Default for ShutdownGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn terminate_all(pids: &[u32]) {
    for &pid in pids {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    tokio::time::sleep(TERM_GRACE).await;
    for &pid in pids {
        let alive = unsafe { libc::kill(pid as libc::pid_t, 0) } == 0;
        if alive {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGKILL);
            }
        }
    }
}

#[cfg(windows)]
async fn terminate_all(pids: &[u32]) {
    let _ = TERM_GRACE;
    for &pid in pids {
        let _ = tokio::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .output()
            .await;
    }
}
