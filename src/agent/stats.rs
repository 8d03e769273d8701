//! Per-run action statistics.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

/// Read-only statistics snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub successful_actions: u32,
    pub failed_actions: u32,
    pub invalid_actions: u32,
    pub retries_used: u32,
    pub total_steps: u32,
}

/// Writer side owned by one run's control loop. Readers get snapshots through
/// [`StatsTracker::snapshot`] or a `watch::Receiver`.
#[derive(Debug, Clone)]
pub struct StatsTracker {
    tx: Arc<watch::Sender<RunStats>>,
}

impl Default for StatsTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(RunStats::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn snapshot(&self) -> RunStats {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunStats> {
        self.tx.subscribe()
    }

    pub fn update(&self, f: impl FnOnce(&mut RunStats)) {
        self.tx.send_modify(f);
    }
}
