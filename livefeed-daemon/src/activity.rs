//! Logs a one-line summary of every applied delta.

use std::sync::atomic::{AtomicU64, Ordering};

use livefeed_sync::{Delta, Listener, ListenerError, Replica};

#[derive(Debug, Default)]
pub struct ActivityLog {
    applied: AtomicU64,
}

impl ActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    fn summary(delta: &Delta) -> String {
        let collections: Vec<&str> = delta.collections().collect();
        let deleted: usize = delta.deletions().iter().map(|(_, ids)| ids.len()).sum();
        format!("collections=[{}] deleted={deleted}", collections.join(","))
    }
}

impl Listener for ActivityLog {
    fn on_delta(&self, delta: &Delta, replica: &Replica) -> Result<(), ListenerError> {
        let n = self.applied.fetch_add(1, Ordering::Relaxed) + 1;
        log::info!(
            "delta #{n}: {} (replica has {} top-level keys)",
            Self::summary(delta),
            replica.root().len()
        );
        Ok(())
    }
}
