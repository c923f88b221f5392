//! A complete registry server: store, policies, replication and the listener.

use crate::config::ServerConfig;
use crate::peer::{PeerClient, WsPeerClient};
use crate::replication::ReplicationCoordinator;
use crate::scheduler::EvictionScheduler;
use crate::self_registration::SelfRegistration;
use crate::server::RegistryServer;
use registry_core::{
    AccessGate, ChannelMetrics, Clock, EvictionQueue, InstanceRecord, LeaseStore, LocalRegistry,
    RegistryError, SelfPreservation,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

pub struct RegistryNode {
    config: ServerConfig,
    coordinator: Arc<ReplicationCoordinator>,
    eviction: Arc<EvictionQueue>,
    server: Arc<RegistryServer>,
    scheduler: Arc<EvictionScheduler>,
    self_registration: Arc<SelfRegistration>,
}

/// Background tasks of a started node. Dropping it stops them.
pub struct NodeHandle {
    pub local_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl NodeHandle {
    /// The URL peers and clients on this host can dial.
    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    pub fn shutdown(mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl RegistryNode {
    /// Build a node talking to the peers named in `config`.
    pub fn new(config: ServerConfig, clock: Arc<dyn Clock>) -> Self {
        let peers = config
            .peers
            .iter()
            .map(|url| {
                Arc::new(WsPeerClient::new(
                    url.clone(),
                    config.server_id.clone(),
                    config.peer_retry.clone(),
                    clock.clone(),
                )) as Arc<dyn PeerClient>
            })
            .collect();
        Self::with_peers(config, clock, peers)
    }

    pub fn with_peers(
        config: ServerConfig,
        clock: Arc<dyn Clock>,
        peers: Vec<Arc<dyn PeerClient>>,
    ) -> Self {
        let now = clock.now_ms();
        let store = Arc::new(LeaseStore::new());
        let preservation = Arc::new(SelfPreservation::new(config.self_preservation.clone(), now));
        let local = LocalRegistry::new(store, preservation, clock.clone());
        let coordinator = Arc::new(ReplicationCoordinator::new(
            config.server_id.clone(),
            local,
            peers,
            AccessGate::new(now, config.wait_time_when_sync_empty),
            config.peer_timeout,
            config.peer_retry.clone(),
        ));
        let eviction = Arc::new(EvictionQueue::new(config.eviction_delay));
        let server = Arc::new(RegistryServer::new(
            coordinator.clone(),
            eviction.clone(),
            clock,
            Arc::new(ChannelMetrics::new()),
            config.heartbeat,
        ));
        let scheduler = Arc::new(EvictionScheduler::new(
            coordinator.clone(),
            eviction.clone(),
            config.eviction_interval,
        ));
        let self_registration = Arc::new(SelfRegistration::new(
            coordinator.clone(),
            config.app_name.clone(),
            config.advertised_address().to_string(),
        ));

        Self {
            config,
            coordinator,
            eviction,
            server,
            scheduler,
            self_registration,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<ReplicationCoordinator> {
        &self.coordinator
    }

    pub fn eviction_queue(&self) -> &Arc<EvictionQueue> {
        &self.eviction
    }

    pub fn server(&self) -> &Arc<RegistryServer> {
        &self.server
    }

    pub fn scheduler(&self) -> &Arc<EvictionScheduler> {
        &self.scheduler
    }

    /// Bind the listener and start accepting connections and evicting.
    pub async fn start(&self) -> std::io::Result<NodeHandle> {
        let listener = RegistryServer::bind(&self.config.listen).await?;
        let local_addr = listener.local_addr()?;
        info!(
            "Registry {} serving on {} with {} peer(s)",
            self.config.server_id,
            local_addr,
            self.coordinator.peer_count()
        );

        let server = Arc::clone(&self.server);
        let serve = tokio::spawn(async move { server.serve(listener).await });
        let evict = Arc::clone(&self.scheduler).spawn();

        Ok(NodeHandle {
            local_addr,
            tasks: vec![serve, evict],
        })
    }

    pub async fn sync_up(&self) -> usize {
        self.coordinator.sync_up().await
    }

    /// Register this server and keep its lease renewed.
    pub async fn self_register(
        &self,
        handle: &mut NodeHandle,
    ) -> Result<Arc<InstanceRecord>, RegistryError> {
        let record = self.self_registration.register().await?;
        handle
            .tasks
            .push(Arc::clone(&self.self_registration).spawn_renewals());
        Ok(record)
    }
}
