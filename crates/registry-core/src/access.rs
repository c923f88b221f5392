//! Startup gate deciding whether this server may serve registry reads.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Holds reads back until the server has data worth serving.
///
/// A server that starts empty and could not pull a snapshot from any peer
/// waits `wait_when_sync_empty` before serving, giving instances time to
/// register with it directly.
#[derive(Debug)]
pub struct AccessGate {
    started_at_ms: u64,
    wait_when_sync_empty: Duration,
    synced: AtomicUsize,
}

impl AccessGate {
    pub fn new(started_at_ms: u64, wait_when_sync_empty: Duration) -> Self {
        Self {
            started_at_ms,
            wait_when_sync_empty,
            synced: AtomicUsize::new(0),
        }
    }

    /// Remember how many instances a snapshot sync brought in.
    pub fn record_sync(&self, count: usize) {
        self.synced.fetch_max(count, Ordering::SeqCst);
    }

    pub fn synced_count(&self) -> usize {
        self.synced.load(Ordering::SeqCst)
    }

    pub fn should_allow_access(&self, local_lease_count: usize, now_ms: u64) -> bool {
        if self.synced_count() > 0 || local_lease_count > 0 {
            return true;
        }
        let waited = now_ms.saturating_sub(self.started_at_ms);
        waited >= self.wait_when_sync_empty.as_millis() as u64
    }
}
