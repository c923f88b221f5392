//! Peer replication coordinator.
//!
//! Wraps the local registry. Mutations that originate on this server are
//! applied locally and then fanned out to every peer; mutations that arrive
//! from a peer are applied with that peer as their source and go no further.

use crate::peer::{calculate_backoff, PeerClient, ReconnectConfig};
use async_trait::async_trait;
use futures::future::join_all;
use rand::Rng;
use registry_core::{
    AccessGate, Delta, InstanceId, InstanceRecord, InstanceRegistry, InstanceStatus, Lease,
    LeaseStore, LocalRegistry, MutationResult, RegistryError, ReplicationMessage,
    ReplicationReply, SelfPreservation, ServerId, Source, StoreError,
};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

/// Reason given to a peer asking for a snapshot before this server may serve reads.
pub const REGISTRY_NOT_READY: &str = "registry not ready";

pub struct ReplicationCoordinator {
    server_id: ServerId,
    local: LocalRegistry,
    peers: Vec<Arc<dyn PeerClient>>,
    access: AccessGate,
    /// This server's own registration, left out of the access gate's count
    own_instance: OnceLock<InstanceId>,
    peer_timeout: Duration,
    sync_retry: ReconnectConfig,
}

impl ReplicationCoordinator {
    pub fn new(
        server_id: ServerId,
        local: LocalRegistry,
        peers: Vec<Arc<dyn PeerClient>>,
        access: AccessGate,
        peer_timeout: Duration,
        sync_retry: ReconnectConfig,
    ) -> Self {
        Self {
            server_id,
            local,
            peers,
            access,
            own_instance: OnceLock::new(),
            peer_timeout,
            sync_retry,
        }
    }

    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    pub fn store(&self) -> &Arc<LeaseStore> {
        self.local.store()
    }

    pub fn preservation(&self) -> &Arc<SelfPreservation> {
        self.local.preservation()
    }

    pub fn now_ms(&self) -> u64 {
        self.local.now_ms()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn mark_own_instance(&self, id: InstanceId) {
        if self.own_instance.set(id).is_err() {
            debug!("own instance already recorded");
        }
    }

    /// Pull a full snapshot from the first peer that answers.
    ///
    /// Each peer gets a bounded number of attempts with backoff in between.
    /// Returns how many instances were registered locally; 0 when no peer
    /// could be reached.
    pub async fn sync_up(&self) -> usize {
        let attempts = self.sync_retry.max_attempts.unwrap_or(1).max(1);

        for peer in &self.peers {
            for attempt in 1..=attempts {
                match timeout(self.peer_timeout, peer.fetch_snapshot()).await {
                    Ok(Ok((origin, _))) if origin == self.server_id => {
                        debug!("Skipping {}: it is this server", peer.label());
                        break;
                    }
                    Ok(Ok((origin, instances))) => {
                        let count = self.apply_snapshot(&origin, instances).await;
                        info!(
                            "Synced {} instance(s) from peer {} ({})",
                            count,
                            peer.label(),
                            origin
                        );
                        self.access.record_sync(count);
                        return count;
                    }
                    Ok(Err(e)) => warn!(
                        "Sync attempt {}/{} with {} failed: {}",
                        attempt,
                        attempts,
                        peer.label(),
                        e
                    ),
                    Err(_) => warn!(
                        "Sync attempt {}/{} with {} timed out after {:?}",
                        attempt,
                        attempts,
                        peer.label(),
                        self.peer_timeout
                    ),
                }

                if attempt < attempts {
                    tokio::time::sleep(self.retry_delay(attempt)).await;
                }
            }
        }

        if !self.peers.is_empty() {
            warn!(
                "{}",
                RegistryError::SyncFailure {
                    peers: self.peers.len()
                }
            );
        }
        0
    }

    /// Whether this server has enough data to serve registry reads.
    ///
    /// There is a single region, so `remote_region_required` does not change
    /// the answer.
    pub fn should_allow_access(&self, remote_region_required: bool) -> bool {
        let mut local = self.store().len();
        if let Some(own) = self.own_instance.get() {
            if self.store().get(own).is_some() {
                // len and get are separate reads
                local = local.saturating_sub(1);
            }
        }
        let allowed = self.access.should_allow_access(local, self.now_ms());
        trace!(
            "should_allow_access(remote_region_required={}) = {}",
            remote_region_required,
            allowed
        );
        allowed
    }

    /// Tell peers about a lease this server evicted.
    pub async fn replicate_eviction(&self, lease: &Lease) {
        let msg = ReplicationMessage::Unregister {
            id: lease.record().id().clone(),
            version: lease.version(),
        };
        self.replicate(msg).await;
    }

    /// Apply a mutation received from peer `origin`. Never re-broadcast.
    pub async fn apply_replicated(
        &self,
        msg: ReplicationMessage,
        origin: &ServerId,
    ) -> ReplicationReply {
        let source = Source::replicated(origin.clone());
        let kind = msg.kind();
        trace!("replicated {} from {}", kind, origin);

        let result = match msg {
            ReplicationMessage::Register { instance } => {
                self.local.register(instance, source).await.map(|_| ())
            }
            ReplicationMessage::Update {
                id,
                base_version,
                version,
                deltas,
            } => self
                .local
                .apply_deltas(&id, base_version, version, &deltas, origin.clone())
                .map(|_| ()),
            ReplicationMessage::Unregister { id, version } => {
                self.local.unregister(&id, version, source).await.map(|_| ())
            }
            ReplicationMessage::StatusUpdate {
                id,
                status,
                version,
            } => self
                .store()
                .status_update(&id, status, version, source, self.now_ms())
                .map(|_| ())
                .map_err(RegistryError::from),
            ReplicationMessage::Heartbeat { id } => match self.local.renew(&id, source).await {
                Ok(true) => Ok(()),
                Ok(false) => Err(StoreError::UnknownInstance(id).into()),
                Err(e) => Err(e),
            },
            ReplicationMessage::FetchSnapshot => {
                if !self.should_allow_access(false) {
                    debug!("Refusing snapshot to {}: registry not ready", origin);
                    return ReplicationReply::Error {
                        reason: REGISTRY_NOT_READY.to_string(),
                    };
                }
                let instances = self
                    .store()
                    .snapshot()
                    .iter()
                    .map(|record| record.as_ref().clone())
                    .collect();
                return ReplicationReply::Snapshot {
                    server_id: self.server_id.clone(),
                    instances,
                };
            }
        };

        match result {
            Ok(()) => ReplicationReply::Ack,
            Err(RegistryError::Store(StoreError::UnknownInstance(id))) => {
                debug!("replicated {} from {} for unknown {}", kind, origin, id);
                ReplicationReply::UnknownInstance { id }
            }
            Err(RegistryError::Store(StoreError::BaseMismatch { id, stored, base })) => {
                debug!(
                    "replicated {} from {} for {} expects v{}, have v{}",
                    kind, origin, id, base, stored
                );
                ReplicationReply::Stale { id }
            }
            Err(e) => {
                warn!("Failed to apply replicated {} from {}: {}", kind, origin, e);
                ReplicationReply::Error {
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn apply_snapshot(&self, origin: &ServerId, instances: Vec<InstanceRecord>) -> usize {
        let mut count = 0;
        for instance in instances {
            let id = instance.id().clone();
            match self
                .local
                .register(instance, Source::replicated(origin.clone()))
                .await
            {
                Ok(result) if result.status.is_applied() => count += 1,
                Ok(_) => debug!("snapshot entry {} older than local copy", id),
                Err(e) => warn!("Skipping snapshot entry {} from {}: {}", id, origin, e),
            }
        }
        count
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let base = calculate_backoff(attempt, &self.sync_retry);
        let jitter_ms = rand::rng().random_range(0..=base.as_millis() as u64 / 10);
        base + Duration::from_millis(jitter_ms)
    }

    /// Send `msg` to every peer in parallel, each bounded by the peer timeout.
    async fn replicate(&self, msg: ReplicationMessage) {
        if self.peers.is_empty() {
            return;
        }
        join_all(self.peers.iter().map(|peer| self.send_to_peer(peer.as_ref(), &msg))).await;
    }

    async fn send_to_peer(&self, peer: &dyn PeerClient, msg: &ReplicationMessage) {
        match self.call_peer(peer, msg).await {
            Ok(ReplicationReply::Ack) => trace!("{} replicated to {}", msg.kind(), peer.label()),
            Ok(ReplicationReply::UnknownInstance { id } | ReplicationReply::Stale { id }) => {
                let Some(record) = self.store().get(&id) else {
                    return;
                };
                debug!("{} is missing {}; sending full registration", peer.label(), id);
                let register = ReplicationMessage::Register {
                    instance: record.as_ref().clone(),
                };
                if let Err(e) = self.call_peer(peer, &register).await {
                    warn!("{}", e);
                }
            }
            Ok(ReplicationReply::Error { reason }) => {
                warn!("Peer {} rejected {}: {}", peer.label(), msg.kind(), reason)
            }
            Ok(other) => debug!("Unexpected reply from {}: {:?}", peer.label(), other),
            Err(e) => warn!("{}", e),
        }
    }

    async fn call_peer(
        &self,
        peer: &dyn PeerClient,
        msg: &ReplicationMessage,
    ) -> Result<ReplicationReply, RegistryError> {
        match timeout(self.peer_timeout, peer.replicate(msg)).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => Err(RegistryError::ReplicationUnreachable {
                peer: peer.label().to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(RegistryError::ReplicationUnreachable {
                peer: peer.label().to_string(),
                reason: format!("no reply within {:?}", self.peer_timeout),
            }),
        }
    }
}

#[async_trait]
impl InstanceRegistry for ReplicationCoordinator {
    async fn register(
        &self,
        record: InstanceRecord,
        source: Source,
    ) -> Result<MutationResult, RegistryError> {
        let result = self.local.register(record.clone(), source).await?;
        if result.status.is_applied() && result.source.should_replicate() {
            self.replicate(ReplicationMessage::Register { instance: record })
                .await;
        }
        Ok(result)
    }

    async fn update(
        &self,
        record: InstanceRecord,
        deltas: Vec<Delta>,
        source: Source,
    ) -> Result<MutationResult, RegistryError> {
        // Peers get deltas against the record this update replaces, which
        // can be newer than the caller's view
        let previous = self.store().get(record.id());
        let result = self.local.update(record.clone(), deltas, source).await?;
        if result.status.is_applied() && result.source.should_replicate() {
            let msg = match previous {
                Some(previous) => ReplicationMessage::Update {
                    id: record.id().clone(),
                    base_version: previous.version(),
                    version: record.version(),
                    deltas: record.diff_older(&previous),
                },
                None => ReplicationMessage::Register { instance: record },
            };
            self.replicate(msg).await;
        }
        Ok(result)
    }

    async fn unregister(
        &self,
        id: &InstanceId,
        version: u64,
        source: Source,
    ) -> Result<MutationResult, RegistryError> {
        let result = self.local.unregister(id, version, source).await?;
        if result.status.is_applied() && result.source.should_replicate() {
            self.replicate(ReplicationMessage::Unregister {
                id: id.clone(),
                version,
            })
            .await;
        }
        Ok(result)
    }

    async fn status_update(
        &self,
        id: &InstanceId,
        status: InstanceStatus,
        source: Source,
    ) -> Result<MutationResult, RegistryError> {
        let result = self.local.status_update(id, status, source).await?;
        if result.status.is_applied() && result.source.should_replicate() {
            if let Some(version) = self.local.latest_version(id) {
                self.replicate(ReplicationMessage::StatusUpdate {
                    id: id.clone(),
                    status,
                    version,
                })
                .await;
            }
        }
        Ok(result)
    }

    async fn renew(&self, id: &InstanceId, source: Source) -> Result<bool, RegistryError> {
        let replicate = source.should_replicate();
        let renewed = self.local.renew(id, source).await?;
        if renewed && replicate {
            self.replicate(ReplicationMessage::Heartbeat { id: id.clone() })
                .await;
        }
        Ok(renewed)
    }

    fn latest_version(&self, id: &InstanceId) -> Option<u64> {
        self.local.latest_version(id)
    }
}
