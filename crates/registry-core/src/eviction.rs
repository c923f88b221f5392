//! Eviction: the delayed queue for vanished connections and the eviction pass.

use crate::instance::{InstanceId, InstanceRecord};
use crate::lease::Lease;
use crate::self_preservation::{SelfPreservation, Verdict};
use crate::source::Source;
use crate::store::LeaseStore;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// An instance whose connection went away without unregistering.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedEviction {
    pub record: Arc<InstanceRecord>,
    pub source: Source,
    /// When the entry becomes eligible (ms)
    pub due_at: u64,
}

/// Delayed eviction candidates, in enqueue order.
#[derive(Debug)]
pub struct EvictionQueue {
    entries: Mutex<VecDeque<QueuedEviction>>,
    delay: Duration,
}

impl EvictionQueue {
    pub fn new(delay: Duration) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            delay,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn add(&self, record: Arc<InstanceRecord>, source: Source, now_ms: u64) {
        let due_at = now_ms + self.delay.as_millis() as u64;
        debug!("queued {} v{} for eviction at {}", record.id(), record.version(), due_at);
        self.lock().push_back(QueuedEviction {
            record,
            source,
            due_at,
        });
    }

    /// Remove and return every entry that is due at `now_ms`.
    pub fn take_due(&self, now_ms: u64) -> Vec<QueuedEviction> {
        let mut entries = self.lock();
        let (due, pending): (VecDeque<_>, VecDeque<_>) =
            entries.drain(..).partition(|e| e.due_at <= now_ms);
        *entries = pending;
        due.into()
    }

    /// Put entries back, keeping their original due time.
    pub fn requeue(&self, entries: Vec<QueuedEviction>) {
        let mut queue = self.lock();
        for entry in entries.into_iter().rev() {
            queue.push_front(entry);
        }
    }

    pub fn contains(&self, id: &InstanceId) -> bool {
        self.lock().iter().any(|e| e.record.id() == id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<QueuedEviction>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// What one eviction pass did.
#[derive(Debug, Clone, PartialEq)]
pub enum EvictionOutcome {
    /// Leases actually removed (possibly none)
    Evicted(Vec<Lease>),
    /// Self-preservation held back this many candidates
    Suppressed { candidates: usize, verdict: Verdict },
}

impl EvictionOutcome {
    pub fn evicted(&self) -> &[Lease] {
        match self {
            EvictionOutcome::Evicted(leases) => leases,
            EvictionOutcome::Suppressed { .. } => &[],
        }
    }
}

/// Run one eviction pass at `now_ms`.
///
/// Candidates are expired leases plus due queue entries. Each candidate is
/// rechecked by the store before deletion, so a renewal or re-registration
/// that raced the scan wins. When self-preservation suppresses the pass,
/// nothing is removed and due queue entries go back in the queue.
pub fn run_eviction_pass(
    store: &LeaseStore,
    preservation: &SelfPreservation,
    queue: &EvictionQueue,
    now_ms: u64,
) -> EvictionOutcome {
    preservation.set_expected(store.expected_renewals_per_min());

    let expired = store.expired(now_ms);
    let due = queue.take_due(now_ms);
    let candidates = expired.len() + due.len();
    if candidates == 0 {
        return EvictionOutcome::Evicted(Vec::new());
    }

    let verdict = preservation.evaluate(now_ms);
    if !verdict.allowed {
        preservation.record_anomaly(&verdict);
        queue.requeue(due);
        return EvictionOutcome::Suppressed { candidates, verdict };
    }

    let mut evicted = Vec::with_capacity(candidates);
    for id in &expired {
        if let Some(lease) = store.evict_if_expired(id, now_ms) {
            info!("Evicted expired lease {} (v{})", id, lease.version());
            evicted.push(lease);
        }
    }
    for entry in due {
        let id = entry.record.id();
        match store.evict_if_version(id, entry.record.version(), now_ms) {
            Some(lease) => {
                info!("Evicted {} (v{}) after its connection closed", id, lease.version());
                evicted.push(lease);
            }
            None => debug!("queued eviction of {} skipped: lease changed or gone", id),
        }
    }
    EvictionOutcome::Evicted(evicted)
}
