//! Periodic eviction.

use crate::replication::ReplicationCoordinator;
use registry_core::eviction::run_eviction_pass;
use registry_core::{EvictionOutcome, EvictionQueue};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

pub struct EvictionScheduler {
    coordinator: Arc<ReplicationCoordinator>,
    queue: Arc<EvictionQueue>,
    interval: Duration,
    running: AtomicBool,
}

/// Clears the running flag when a run ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RunGuard(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl EvictionScheduler {
    pub fn new(
        coordinator: Arc<ReplicationCoordinator>,
        queue: Arc<EvictionQueue>,
        interval: Duration,
    ) -> Self {
        Self {
            coordinator,
            queue,
            interval,
            running: AtomicBool::new(false),
        }
    }

    /// One eviction run. Returns `None` if the previous run is still going.
    pub async fn run_once(&self) -> Option<EvictionOutcome> {
        let Some(_guard) = RunGuard::acquire(&self.running) else {
            debug!("Previous eviction run still in progress, skipping");
            return None;
        };

        let outcome = run_eviction_pass(
            self.coordinator.store(),
            self.coordinator.preservation(),
            &self.queue,
            self.coordinator.now_ms(),
        );

        let evicted = outcome.evicted();
        if !evicted.is_empty() {
            info!("Evicted {} lease(s)", evicted.len());
        }
        for lease in evicted {
            self.coordinator.replicate_eviction(lease).await;
        }
        Some(outcome)
    }

    /// Run on a fixed period until the returned task is aborted.
    ///
    /// Each run is its own task so a slow run makes the next tick skip
    /// rather than queue up behind it.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let scheduler = Arc::clone(&self);
                tokio::spawn(async move {
                    scheduler.run_once().await;
                });
            }
        })
    }
}
