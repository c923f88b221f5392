//! The lease store: identity → current record + lease timing.
//!
//! Each identity has its own slot behind its own mutex. The slot map is only
//! write-locked to insert or retire a slot, so mutations of unrelated
//! identities never serialize on each other. Every write is a version
//! compare-and-set: a write whose version is not newer than the stored one is
//! dropped and reported as `Status::Superseded`.

use crate::delta::Delta;
use crate::instance::{InstanceId, InstanceRecord, InstanceStatus};
use crate::lease::Lease;
use crate::source::Source;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Unknown instance: {0}")]
    UnknownInstance(InstanceId),
    #[error("Invalid instance record: {0}")]
    InvalidRecord(String),
    #[error("Instance {id} is at v{stored}, deltas were computed against v{base}")]
    BaseMismatch { id: InstanceId, stored: u64, base: u64 },
}

/// Outcome of a store mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// New lease created
    Added,
    /// Existing lease now holds a newer record
    Modified,
    /// Lease removed
    Removed,
    /// Write carried a stale version (or targeted nothing) and was dropped
    Superseded,
}

impl Status {
    pub fn is_applied(&self) -> bool {
        !matches!(self, Status::Superseded)
    }
}

/// Status plus the provenance the mutation was applied with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationResult {
    pub status: Status,
    pub source: Source,
}

impl MutationResult {
    fn new(status: Status, source: Source) -> Self {
        Self { status, source }
    }
}

#[derive(Debug, Default)]
struct Slot {
    lease: Option<Lease>,
    /// Set when the slot has been emptied and is about to leave the map.
    /// Anyone who grabbed it before removal must look it up again.
    retired: bool,
}

type SlotRef = Arc<Mutex<Slot>>;

/// Concurrent map of leases keyed by instance identity.
#[derive(Debug, Default)]
pub struct LeaseStore {
    slots: RwLock<HashMap<InstanceId, SlotRef>>,
    lease_count: AtomicUsize,
}

impl LeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an instance, or replace the stored record if this one is newer.
    pub fn register(
        &self,
        record: InstanceRecord,
        source: Source,
        now_ms: u64,
    ) -> Result<MutationResult, StoreError> {
        record.validate().map_err(StoreError::InvalidRecord)?;
        let id = record.id().clone();
        let version = record.version();

        let status = self
            .with_slot(&id, true, |slot| match slot {
                Some(lease) if lease.version() >= version => Status::Superseded,
                Some(lease) => {
                    lease.replace(Arc::new(record), source.clone(), now_ms);
                    Status::Modified
                }
                None => {
                    *slot = Some(Lease::new(Arc::new(record), source.clone(), now_ms));
                    Status::Added
                }
            })
            .unwrap_or(Status::Superseded);

        debug!("register {} v{} from {}: {:?}", id, version, source, status);
        Ok(MutationResult::new(status, source))
    }

    /// Replace the stored record with a newer full record.
    ///
    /// `deltas` describe what changed; they are carried for replication and
    /// logging, the record itself is authoritative.
    pub fn update(
        &self,
        record: InstanceRecord,
        deltas: &[Delta],
        source: Source,
        now_ms: u64,
    ) -> Result<MutationResult, StoreError> {
        record.validate().map_err(StoreError::InvalidRecord)?;
        let id = record.id().clone();
        let version = record.version();

        let status = self
            .with_slot(&id, false, |slot| match slot {
                Some(lease) if lease.version() >= version => Status::Superseded,
                Some(lease) => {
                    lease.replace(Arc::new(record), source.clone(), now_ms);
                    Status::Modified
                }
                None => Status::Superseded,
            })
            .ok_or_else(|| StoreError::UnknownInstance(id.clone()))?;

        debug!(
            "update {} v{} from {} ({} delta(s)): {:?}",
            id,
            version,
            source,
            deltas.len(),
            status
        );
        Ok(MutationResult::new(status, source))
    }

    /// Apply replicated deltas on top of the stored record.
    ///
    /// The deltas only reproduce the sender's record when applied to the
    /// version they were computed against, so a stored record at any other
    /// version than `base_version` is left alone and reported as
    /// `StoreError::BaseMismatch`. The base is read under the same lock the
    /// write happens under.
    pub fn update_with_deltas(
        &self,
        id: &InstanceId,
        base_version: u64,
        version: u64,
        deltas: &[Delta],
        source: Source,
        now_ms: u64,
    ) -> Result<MutationResult, StoreError> {
        let outcome = self
            .with_slot(id, false, |slot| match slot {
                Some(lease) if lease.version() >= version => Ok(Status::Superseded),
                Some(lease) if lease.version() != base_version => Err(StoreError::BaseMismatch {
                    id: id.clone(),
                    stored: lease.version(),
                    base: base_version,
                }),
                Some(lease) => {
                    let next = lease.record().apply_deltas(deltas, version);
                    next.validate().map_err(StoreError::InvalidRecord)?;
                    lease.replace(Arc::new(next), source.clone(), now_ms);
                    Ok(Status::Modified)
                }
                None => Err(StoreError::UnknownInstance(id.clone())),
            })
            .ok_or_else(|| StoreError::UnknownInstance(id.clone()))?;

        let status = outcome?;
        debug!("delta update {} v{} from {}: {:?}", id, version, source, status);
        Ok(MutationResult::new(status, source))
    }

    /// Change only the status, at a new version.
    pub fn status_update(
        &self,
        id: &InstanceId,
        status: InstanceStatus,
        version: u64,
        source: Source,
        now_ms: u64,
    ) -> Result<MutationResult, StoreError> {
        let result = self
            .with_slot(id, false, |slot| match slot {
                Some(lease) if lease.version() >= version => Status::Superseded,
                Some(lease) => {
                    let next = lease.record().as_ref().clone().with_status(status).with_version(version);
                    lease.replace(Arc::new(next), source.clone(), now_ms);
                    Status::Modified
                }
                None => Status::Superseded,
            })
            .ok_or_else(|| StoreError::UnknownInstance(id.clone()))?;

        debug!("status {} -> {:?} v{} from {}: {:?}", id, status, version, source, result);
        Ok(MutationResult::new(result, source))
    }

    /// Remove the lease for `id` unless a newer version has been stored since.
    ///
    /// Removing an identity that has no lease is a no-op.
    pub fn unregister(
        &self,
        id: &InstanceId,
        version: u64,
        source: Source,
        _now_ms: u64,
    ) -> Result<MutationResult, StoreError> {
        let status = self
            .with_slot(id, false, |slot| match slot {
                Some(lease) if lease.version() > version => Status::Superseded,
                Some(_) => {
                    *slot = None;
                    Status::Removed
                }
                None => Status::Superseded,
            })
            .unwrap_or(Status::Superseded);

        debug!("unregister {} v{} from {}: {:?}", id, version, source, status);
        Ok(MutationResult::new(status, source))
    }

    /// Refresh the renewal timestamp. The version does not change.
    ///
    /// Returns false when there is no lease to renew.
    pub fn renew(&self, id: &InstanceId, now_ms: u64) -> bool {
        let renewed = self
            .with_slot(id, false, |slot| match slot {
                Some(lease) => {
                    lease.renew(now_ms);
                    true
                }
                None => false,
            })
            .unwrap_or(false);
        trace!("renew {}: {}", id, renewed);
        renewed
    }

    /// Evict `id` if its lease is expired at `now_ms`.
    ///
    /// The expiry is checked again under the identity's lock, so a renewal
    /// that raced the scan keeps the lease alive.
    pub fn evict_if_expired(&self, id: &InstanceId, now_ms: u64) -> Option<Lease> {
        self.with_slot(id, false, |slot| match slot {
            Some(lease) if lease.is_expired(now_ms) => slot.take().map(|mut lease| {
                lease.mark_evicted(now_ms);
                lease
            }),
            _ => None,
        })
        .flatten()
    }

    /// Evict `id` only if the stored lease still holds `version`.
    pub fn evict_if_version(&self, id: &InstanceId, version: u64, now_ms: u64) -> Option<Lease> {
        self.with_slot(id, false, |slot| match slot {
            Some(lease) if lease.version() == version => slot.take().map(|mut lease| {
                lease.mark_evicted(now_ms);
                lease
            }),
            _ => None,
        })
        .flatten()
    }

    pub fn get(&self, id: &InstanceId) -> Option<Arc<InstanceRecord>> {
        self.lease(id).map(|lease| Arc::clone(lease.record()))
    }

    pub fn lease(&self, id: &InstanceId) -> Option<Lease> {
        self.with_slot(id, false, |slot| slot.clone()).flatten()
    }

    pub fn latest_version(&self, id: &InstanceId) -> Option<u64> {
        self.with_slot(id, false, |slot| slot.as_ref().map(Lease::version))
            .flatten()
    }

    /// All current records.
    pub fn snapshot(&self) -> Vec<Arc<InstanceRecord>> {
        self.leases()
            .into_iter()
            .map(|lease| Arc::clone(lease.record()))
            .collect()
    }

    /// All current leases.
    pub fn leases(&self) -> Vec<Lease> {
        self.slot_refs()
            .iter()
            .filter_map(|slot| lock(slot).lease.clone())
            .collect()
    }

    /// Identities whose lease has expired at `now_ms`.
    pub fn expired(&self, now_ms: u64) -> Vec<InstanceId> {
        self.slot_refs()
            .iter()
            .filter_map(|slot| {
                let slot = lock(slot);
                slot.lease
                    .as_ref()
                    .filter(|lease| lease.is_expired(now_ms))
                    .map(|lease| lease.record().id().clone())
            })
            .collect()
    }

    /// Sum of the renewals every registered instance promises per minute.
    pub fn expected_renewals_per_min(&self) -> f64 {
        self.slot_refs()
            .iter()
            .filter_map(|slot| {
                lock(slot)
                    .lease
                    .as_ref()
                    .map(|lease| lease.record().lease().expected_renewals_per_min())
            })
            .sum()
    }

    pub fn len(&self) -> usize {
        self.lease_count.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot_refs(&self) -> Vec<SlotRef> {
        self.slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn lookup(&self, id: &InstanceId, create: bool) -> Option<SlotRef> {
        {
            let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
            if let Some(slot) = slots.get(id) {
                return Some(Arc::clone(slot));
            }
        }
        if !create {
            return None;
        }
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        Some(Arc::clone(slots.entry(id.clone()).or_default()))
    }

    /// Run `f` on the lease slot for `id` while holding that identity's lock.
    ///
    /// Returns `None` when `create` is false and the identity has no slot.
    /// A slot left empty by `f` is retired and removed from the map.
    fn with_slot<R>(
        &self,
        id: &InstanceId,
        create: bool,
        f: impl FnOnce(&mut Option<Lease>) -> R,
    ) -> Option<R> {
        loop {
            let slot = self.lookup(id, create)?;
            let mut guard = lock(&slot);
            if guard.retired {
                drop(guard);
                std::thread::yield_now();
                continue;
            }

            let had_lease = guard.lease.is_some();
            let out = f(&mut guard.lease);
            let has_lease = guard.lease.is_some();

            match (had_lease, has_lease) {
                (false, true) => {
                    self.lease_count.fetch_add(1, Ordering::SeqCst);
                }
                (true, false) => {
                    self.lease_count.fetch_sub(1, Ordering::SeqCst);
                }
                _ => {}
            }

            if !has_lease {
                guard.retired = true;
                drop(guard);
                self.retire(id, &slot);
            }
            return Some(out);
        }
    }

    fn retire(&self, id: &InstanceId, slot: &SlotRef) {
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        if slots.get(id).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            slots.remove(id);
        }
    }
}

fn lock(slot: &SlotRef) -> std::sync::MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::ServicePort;
    use crate::server_id::ServerId;
    use std::thread;

    fn record(id: &str, version: u64) -> InstanceRecord {
        InstanceRecord::builder(id, "app")
            .port(ServicePort::new("http", 8080))
            .lease(90, 30)
            .version(version)
            .build()
    }

    fn peer() -> ServerId {
        "registry-a".parse().unwrap()
    }

    // ==================== Register ====================

    #[test]
    fn test_register_adds_lease() {
        let store = LeaseStore::new();
        let result = store.register(record("a", 1), Source::Local, 0).unwrap();

        assert_eq!(result.status, Status::Added);
        assert_eq!(result.source, Source::Local);
        assert_eq!(store.len(), 1);
        assert_eq!(store.latest_version(&"a".into()), Some(1));
    }

    #[test]
    fn test_register_newer_version_replaces() {
        let store = LeaseStore::new();
        store.register(record("a", 1), Source::Local, 0).unwrap();
        let result = store.register(record("a", 5), Source::Local, 10).unwrap();

        assert_eq!(result.status, Status::Modified);
        assert_eq!(store.len(), 1);
        assert_eq!(store.latest_version(&"a".into()), Some(5));
    }

    #[test]
    fn test_register_stale_version_superseded() {
        let store = LeaseStore::new();
        store.register(record("a", 3), Source::Local, 0).unwrap();

        let equal = store.register(record("a", 3), Source::Local, 0).unwrap();
        let older = store.register(record("a", 2), Source::Local, 0).unwrap();

        assert_eq!(equal.status, Status::Superseded);
        assert_eq!(older.status, Status::Superseded);
        assert_eq!(store.latest_version(&"a".into()), Some(3));
    }

    #[test]
    fn test_register_invalid_record() {
        let store = LeaseStore::new();
        let bad = InstanceRecord::builder("", "app").build();
        assert!(matches!(
            store.register(bad, Source::Local, 0),
            Err(StoreError::InvalidRecord(_))
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn test_register_keeps_replicated_source() {
        let store = LeaseStore::new();
        store
            .register(record("a", 1), Source::replicated(peer()), 0)
            .unwrap();
        let lease = store.lease(&"a".into()).unwrap();
        assert_eq!(lease.source(), &Source::replicated(peer()));
    }

    // ==================== Update ====================

    #[test]
    fn test_update_unknown_instance() {
        let store = LeaseStore::new();
        let err = store.update(record("a", 2), &[], Source::Local, 0).unwrap_err();
        assert_eq!(err, StoreError::UnknownInstance("a".into()));
    }

    #[test]
    fn test_update_with_deltas_applies_to_stored_record() {
        let store = LeaseStore::new();
        store.register(record("a", 1), Source::Local, 0).unwrap();

        let deltas = vec![Delta::Status(InstanceStatus::Down)];
        let result = store
            .update_with_deltas(&"a".into(), 1, 2, &deltas, Source::replicated(peer()), 5)
            .unwrap();

        assert_eq!(result.status, Status::Modified);
        let stored = store.get(&"a".into()).unwrap();
        assert_eq!(stored.status(), InstanceStatus::Down);
        assert_eq!(stored.version(), 2);
        assert_eq!(stored.ports().len(), 1);
    }

    #[test]
    fn test_update_with_deltas_stale() {
        let store = LeaseStore::new();
        store.register(record("a", 4), Source::Local, 0).unwrap();
        let result = store
            .update_with_deltas(&"a".into(), 3, 4, &[], Source::Local, 0)
            .unwrap();
        assert_eq!(result.status, Status::Superseded);
    }

    #[test]
    fn test_update_with_deltas_rejects_other_base() {
        let store = LeaseStore::new();
        store.register(record("a", 1), Source::Local, 0).unwrap();

        // v2 never arrived; these deltas take v2 to v3
        let deltas = vec![Delta::Status(InstanceStatus::Down)];
        let err = store
            .update_with_deltas(&"a".into(), 2, 3, &deltas, Source::replicated(peer()), 5)
            .unwrap_err();

        assert_eq!(
            err,
            StoreError::BaseMismatch {
                id: "a".into(),
                stored: 1,
                base: 2
            }
        );
        let stored = store.get(&"a".into()).unwrap();
        assert_eq!(stored.version(), 1);
        assert_ne!(stored.status(), InstanceStatus::Down);
    }

    #[test]
    fn test_status_update() {
        let store = LeaseStore::new();
        store.register(record("a", 1), Source::Local, 0).unwrap();

        let result = store
            .status_update(&"a".into(), InstanceStatus::OutOfService, 2, Source::Local, 0)
            .unwrap();
        assert_eq!(result.status, Status::Modified);
        assert_eq!(
            store.get(&"a".into()).unwrap().status(),
            InstanceStatus::OutOfService
        );

        assert!(store
            .status_update(&"b".into(), InstanceStatus::Up, 1, Source::Local, 0)
            .is_err());
    }

    // ==================== Unregister / renew / evict ====================

    #[test]
    fn test_unregister_removes() {
        let store = LeaseStore::new();
        store.register(record("a", 1), Source::Local, 0).unwrap();

        let result = store.unregister(&"a".into(), 1, Source::Local, 0).unwrap();
        assert_eq!(result.status, Status::Removed);
        assert!(store.is_empty());
        assert!(store.get(&"a".into()).is_none());
    }

    #[test]
    fn test_unregister_older_version_keeps_newer_registration() {
        let store = LeaseStore::new();
        store.register(record("a", 3), Source::Local, 0).unwrap();

        let result = store.unregister(&"a".into(), 2, Source::Local, 0).unwrap();
        assert_eq!(result.status, Status::Superseded);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_unregister_absent_is_noop() {
        let store = LeaseStore::new();
        let result = store.unregister(&"ghost".into(), 1, Source::Local, 0).unwrap();
        assert_eq!(result.status, Status::Superseded);
    }

    #[test]
    fn test_renew_keeps_version() {
        let store = LeaseStore::new();
        store.register(record("a", 1), Source::Local, 0).unwrap();

        assert!(store.renew(&"a".into(), 60_000));
        let lease = store.lease(&"a".into()).unwrap();
        assert_eq!(lease.last_renewal_timestamp(), 60_000);
        assert_eq!(lease.version(), 1);

        assert!(!store.renew(&"ghost".into(), 60_000));
    }

    #[test]
    fn test_expired_and_evict() {
        let store = LeaseStore::new();
        store.register(record("a", 1), Source::Local, 0).unwrap();
        store.register(record("b", 1), Source::Local, 50_000).unwrap();

        assert_eq!(store.expired(95_000), vec![InstanceId::from("a")]);

        let evicted = store.evict_if_expired(&"a".into(), 95_000).unwrap();
        assert_eq!(evicted.eviction_timestamp(), Some(95_000));
        assert!(store.evict_if_expired(&"b".into(), 95_000).is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_evict_rechecks_renewal() {
        let store = LeaseStore::new();
        store.register(record("a", 1), Source::Local, 0).unwrap();

        let expired = store.expired(95_000);
        assert_eq!(expired.len(), 1);

        // Renewal lands between the scan and the delete
        store.renew(&"a".into(), 94_000);
        assert!(store.evict_if_expired(&"a".into(), 95_000).is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_evict_absent_is_noop() {
        let store = LeaseStore::new();
        assert!(store.evict_if_expired(&"ghost".into(), 0).is_none());
        assert!(store.evict_if_version(&"ghost".into(), 1, 0).is_none());
    }

    #[test]
    fn test_evict_if_version() {
        let store = LeaseStore::new();
        store.register(record("a", 2), Source::Local, 0).unwrap();

        assert!(store.evict_if_version(&"a".into(), 1, 0).is_none());
        assert!(store.evict_if_version(&"a".into(), 2, 0).is_some());
        assert!(store.is_empty());
    }

    #[test]
    fn test_register_after_removal_reuses_identity() {
        let store = LeaseStore::new();
        store.register(record("a", 1), Source::Local, 0).unwrap();
        store.unregister(&"a".into(), 1, Source::Local, 0).unwrap();

        let result = store.register(record("a", 1), Source::Local, 0).unwrap();
        assert_eq!(result.status, Status::Added);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_expected_renewals() {
        let store = LeaseStore::new();
        store.register(record("a", 1), Source::Local, 0).unwrap();
        store
            .register(
                InstanceRecord::builder("b", "app").lease(30, 10).version(1).build(),
                Source::Local,
                0,
            )
            .unwrap();
        assert_eq!(store.expected_renewals_per_min(), 2.0 + 6.0);
    }

    // ==================== Concurrency ====================

    #[test]
    fn test_concurrent_updates_never_regress_version() {
        let store = Arc::new(LeaseStore::new());
        store.register(record("a", 1), Source::Local, 0).unwrap();

        let handles: Vec<_> = (0..8u64)
            .map(|worker| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    let mut highest_seen = 0;
                    for step in 0..200u64 {
                        let version = 2 + step * 8 + worker;
                        store
                            .update(record("a", version), &[], Source::Local, 0)
                            .unwrap();
                        let current = store.latest_version(&"a".into()).unwrap();
                        assert!(current >= highest_seen, "version went backwards");
                        assert!(current >= version);
                        highest_seen = current;
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.latest_version(&"a".into()), Some(2 + 199 * 8 + 7));
    }

    #[test]
    fn test_concurrent_register_unregister_counts_stay_consistent() {
        let store = Arc::new(LeaseStore::new());

        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for round in 0..100u64 {
                        let id = format!("w{}-{}", worker, round % 5);
                        store.register(record(&id, round + 1), Source::Local, 0).unwrap();
                        store
                            .unregister(&InstanceId::new(id), round + 1, Source::Local, 0)
                            .unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.len(), 0);
        assert!(store.snapshot().is_empty());
    }
}
