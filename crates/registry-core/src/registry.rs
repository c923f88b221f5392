//! The registry seam channels talk to.
//!
//! `LocalRegistry` applies mutations to this server's store only. The daemon
//! wraps it in a replication coordinator that also fans local mutations out
//! to peers; channels cannot tell the difference.

use crate::clock::Clock;
use crate::delta::Delta;
use crate::instance::{InstanceId, InstanceRecord, InstanceStatus};
use crate::self_preservation::SelfPreservation;
use crate::server_id::ServerId;
use crate::source::Source;
use crate::store::{LeaseStore, MutationResult, StoreError};
use crate::transport::TransportError;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Peer {peer} unreachable: {reason}")]
    ReplicationUnreachable { peer: String, reason: String },
    #[error("Could not sync from any of {peers} peer(s)")]
    SyncFailure { peers: usize },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Mutations a registration channel (or a peer) can request.
#[async_trait]
pub trait InstanceRegistry: Send + Sync {
    async fn register(
        &self,
        record: InstanceRecord,
        source: Source,
    ) -> Result<MutationResult, RegistryError>;

    /// `record` is the full new record; `deltas` say what changed since the
    /// previous version.
    async fn update(
        &self,
        record: InstanceRecord,
        deltas: Vec<Delta>,
        source: Source,
    ) -> Result<MutationResult, RegistryError>;

    async fn unregister(
        &self,
        id: &InstanceId,
        version: u64,
        source: Source,
    ) -> Result<MutationResult, RegistryError>;

    async fn status_update(
        &self,
        id: &InstanceId,
        status: InstanceStatus,
        source: Source,
    ) -> Result<MutationResult, RegistryError>;

    /// Returns false when there is no lease to renew.
    async fn renew(&self, id: &InstanceId, source: Source) -> Result<bool, RegistryError>;

    fn latest_version(&self, id: &InstanceId) -> Option<u64>;
}

/// Registry backed directly by this server's lease store.
pub struct LocalRegistry {
    store: Arc<LeaseStore>,
    preservation: Arc<SelfPreservation>,
    clock: Arc<dyn Clock>,
}

impl LocalRegistry {
    pub fn new(
        store: Arc<LeaseStore>,
        preservation: Arc<SelfPreservation>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            preservation,
            clock,
        }
    }

    pub fn store(&self) -> &Arc<LeaseStore> {
        &self.store
    }

    pub fn preservation(&self) -> &Arc<SelfPreservation> {
        &self.preservation
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Apply deltas received from a peer on top of the stored record, which
    /// must be at `base_version`.
    pub fn apply_deltas(
        &self,
        id: &InstanceId,
        base_version: u64,
        version: u64,
        deltas: &[Delta],
        origin: ServerId,
    ) -> Result<MutationResult, RegistryError> {
        Ok(self.store.update_with_deltas(
            id,
            base_version,
            version,
            deltas,
            Source::replicated(origin),
            self.now_ms(),
        )?)
    }
}

#[async_trait]
impl InstanceRegistry for LocalRegistry {
    async fn register(
        &self,
        record: InstanceRecord,
        source: Source,
    ) -> Result<MutationResult, RegistryError> {
        Ok(self.store.register(record, source, self.now_ms())?)
    }

    async fn update(
        &self,
        record: InstanceRecord,
        deltas: Vec<Delta>,
        source: Source,
    ) -> Result<MutationResult, RegistryError> {
        Ok(self.store.update(record, &deltas, source, self.now_ms())?)
    }

    async fn unregister(
        &self,
        id: &InstanceId,
        version: u64,
        source: Source,
    ) -> Result<MutationResult, RegistryError> {
        Ok(self.store.unregister(id, version, source, self.now_ms())?)
    }

    /// Bumps the stored version by one.
    async fn status_update(
        &self,
        id: &InstanceId,
        status: InstanceStatus,
        source: Source,
    ) -> Result<MutationResult, RegistryError> {
        let version = self
            .store
            .latest_version(id)
            .ok_or_else(|| StoreError::UnknownInstance(id.clone()))?
            + 1;
        Ok(self
            .store
            .status_update(id, status, version, source, self.now_ms())?)
    }

    async fn renew(&self, id: &InstanceId, _source: Source) -> Result<bool, RegistryError> {
        let now = self.now_ms();
        let renewed = self.store.renew(id, now);
        if renewed {
            self.preservation.record_renewal(now);
        }
        Ok(renewed)
    }

    fn latest_version(&self, id: &InstanceId) -> Option<u64> {
        self.store.latest_version(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::self_preservation::SelfPreservationConfig;
    use crate::store::Status;
    use std::time::Duration;

    fn registry() -> (LocalRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let registry = LocalRegistry::new(
            Arc::new(LeaseStore::new()),
            Arc::new(SelfPreservation::new(SelfPreservationConfig::default(), 0)),
            clock.clone(),
        );
        (registry, clock)
    }

    fn record(version: u64) -> InstanceRecord {
        InstanceRecord::builder("web-1", "web").version(version).build()
    }

    #[tokio::test]
    async fn test_renew_counts_for_self_preservation() {
        let (registry, clock) = registry();
        registry.register(record(1), Source::Local).await.unwrap();

        clock.advance(Duration::from_secs(30));
        assert!(registry.renew(&"web-1".into(), Source::Local).await.unwrap());
        assert!(!registry.renew(&"ghost".into(), Source::Local).await.unwrap());

        assert_eq!(registry.preservation().observed_per_min(60_000), 1.0);
        let lease = registry.store().lease(&"web-1".into()).unwrap();
        assert_eq!(lease.last_renewal_timestamp(), 30_000);
    }

    #[tokio::test]
    async fn test_status_update_bumps_version() {
        let (registry, _clock) = registry();
        registry.register(record(4), Source::Local).await.unwrap();

        let result = registry
            .status_update(&"web-1".into(), InstanceStatus::Down, Source::Local)
            .await
            .unwrap();
        assert_eq!(result.status, Status::Modified);
        assert_eq!(registry.latest_version(&"web-1".into()), Some(5));
    }

    #[tokio::test]
    async fn test_status_update_unknown() {
        let (registry, _clock) = registry();
        let err = registry
            .status_update(&"ghost".into(), InstanceStatus::Down, Source::Local)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Store(StoreError::UnknownInstance(_))));
    }
}
