use tokio::sync::watch;

/// Coordinates staged slot launches: slot k+1 may start only after slot k
/// has picked a task or its process has exited.
///
/// The counter is monotone; every waiter whose target is at or below the
/// counter is unblocked.
pub struct StagedLaunchGate {
    picked: watch::Sender<u32>,
}

impl StagedLaunchGate {
    pub fn new() -> Self {
        let (picked, _) = watch::channel(0);
        Self { picked }
    }

    pub fn picked(&self) -> u32 {
        *self.picked.borrow()
    }

    /// Returns immediately when the counter already reached `target`.
    pub async fn wait_for_picked(&self, target: u32) {
        let mut rx = self.picked.subscribe();
        // The sender lives as long as `self`, so wait_for cannot fail here.
        let _ = rx.wait_for(|picked| *picked >= target).await;
    }

    pub fn release_picked_readiness(&self) {
        self.picked.send_modify(|picked| *picked += 1);
    }
}

impl Default for StagedLaunchGate {
    fn default() -> Self {
        Self::new()
    }
}
