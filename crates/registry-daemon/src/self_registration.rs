//! The registry server registering itself as an instance.
//!
//! Registration happens at most once per process. Every caller, whether it
//! triggered the registration or arrived later, gets the same record.

use crate::replication::ReplicationCoordinator;
use registry_core::{
    DataCenterInfo, InstanceId, InstanceRecord, InstanceRegistry, InstanceStatus, NetworkAddress,
    RegistryError, ServicePort, Source,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Name of the port clients and peers connect to.
pub const REGISTRATION_PORT_NAME: &str = "registration";

pub struct SelfRegistration {
    coordinator: Arc<ReplicationCoordinator>,
    app_name: String,
    advertised: String,
    record: OnceCell<Arc<InstanceRecord>>,
}

impl SelfRegistration {
    pub fn new(coordinator: Arc<ReplicationCoordinator>, app_name: String, advertised: String) -> Self {
        Self {
            coordinator,
            app_name,
            advertised,
            record: OnceCell::new(),
        }
    }

    /// Register this server, or return the record from the first registration.
    ///
    /// The instance is registered as `Starting` and then marked `Up`; peers
    /// see both steps.
    pub async fn register(&self) -> Result<Arc<InstanceRecord>, RegistryError> {
        self.record
            .get_or_try_init(|| async {
                let record = self.build_record();
                let version = self.coordinator.latest_version(record.id()).unwrap_or(0) + 1;
                let record = record.with_version(version);
                let id = record.id().clone();

                self.coordinator.register(record.clone(), Source::Local).await?;
                self.coordinator.mark_own_instance(id.clone());
                self.coordinator
                    .status_update(&id, InstanceStatus::Up, Source::Local)
                    .await?;

                let record = self
                    .coordinator
                    .store()
                    .get(&id)
                    .unwrap_or_else(|| Arc::new(record.with_status(InstanceStatus::Up)));
                info!("Registered this server as {} ({})", id, self.app_name);
                Ok::<_, RegistryError>(record)
            })
            .await
            .map(Arc::clone)
    }

    pub fn registered(&self) -> Option<Arc<InstanceRecord>> {
        self.record.get().cloned()
    }

    /// Keep this server's own lease alive until the task is aborted.
    pub fn spawn_renewals(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let Some(record) = self.registered() else {
                warn!("Renewal loop started before self-registration; nothing to renew");
                return;
            };
            let interval = Duration::from_secs(u64::from(record.lease().renewal_interval_secs));
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                self.renew_once(&record).await;
            }
        })
    }

    async fn renew_once(&self, record: &InstanceRecord) {
        match self.coordinator.renew(record.id(), Source::Local).await {
            Ok(true) => debug!("Renewed own lease {}", record.id()),
            Ok(false) => {
                let version = self.coordinator.latest_version(record.id()).unwrap_or(record.version()) + 1;
                info!("Own lease {} was evicted; registering again as v{}", record.id(), version);
                let again = record.clone().with_version(version);
                if let Err(e) = self.coordinator.register(again, Source::Local).await {
                    warn!("Failed to re-register {}: {}", record.id(), e);
                }
            }
            Err(e) => warn!("Failed to renew own lease {}: {}", record.id(), e),
        }
    }

    fn build_record(&self) -> InstanceRecord {
        let id = InstanceId::new(format!(
            "{}#{}",
            self.app_name,
            uuid::Uuid::new_v4().simple()
        ));
        let (host, port) = split_host_port(&self.advertised);

        InstanceRecord::builder(id.as_str(), self.app_name.as_str())
            .vip_address(self.app_name.as_str())
            .data_center(DataCenterInfo::new(
                "default",
                vec![NetworkAddress::private(host)],
            ))
            .port(ServicePort::new(REGISTRATION_PORT_NAME, port))
            .status(InstanceStatus::Starting)
            .build()
    }
}

/// Split `ws://host:port/path`, `host:port` or `host` into host and port.
///
/// A missing or unparseable port yields 0.
pub fn split_host_port(addr: &str) -> (String, u16) {
    let without_scheme = addr.split_once("://").map_or(addr, |(_, rest)| rest);
    let authority = without_scheme.split('/').next().unwrap_or_default();
    match authority.rsplit_once(':') {
        Some((host, port)) => (
            host.trim_matches(|c| c == '[' || c == ']').to_string(),
            port.parse().unwrap_or(0),
        ),
        None => (authority.to_string(), 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{PeerClient, ReconnectConfig};
    use async_trait::async_trait;
    use registry_core::{
        AccessGate, LeaseStore, LocalRegistry, ManualClock, ReplicationMessage, ReplicationReply,
        SelfPreservation, SelfPreservationConfig, TransportError,
    };
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingPeer {
        sent: Mutex<Vec<ReplicationMessage>>,
    }

    #[async_trait]
    impl PeerClient for RecordingPeer {
        fn label(&self) -> &str {
            "recording"
        }

        async fn replicate(
            &self,
            msg: &ReplicationMessage,
        ) -> Result<ReplicationReply, TransportError> {
            self.sent.lock().unwrap().push(msg.clone());
            Ok(ReplicationReply::Ack)
        }
    }

    fn self_registration() -> Arc<SelfRegistration> {
        self_registration_with(Vec::new())
    }

    fn self_registration_with(peers: Vec<Arc<dyn PeerClient>>) -> Arc<SelfRegistration> {
        let clock = Arc::new(ManualClock::new(0));
        let local = LocalRegistry::new(
            Arc::new(LeaseStore::new()),
            Arc::new(SelfPreservation::new(SelfPreservationConfig::default(), 0)),
            clock,
        );
        let coordinator = Arc::new(ReplicationCoordinator::new(
            "registry-a".parse().unwrap(),
            local,
            peers,
            AccessGate::new(0, Duration::from_secs(300)),
            Duration::from_millis(100),
            ReconnectConfig::default(),
        ));
        Arc::new(SelfRegistration::new(
            coordinator,
            "registry".to_string(),
            "ws://10.0.0.1:8761".to_string(),
        ))
    }

    #[tokio::test]
    async fn test_registers_once() {
        let reg = self_registration();
        let first = reg.register().await.unwrap();
        let second = reg.register().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(reg.coordinator.store().len(), 1);
        assert!(first.id().as_str().starts_with("registry#"));
        assert_eq!(first.version(), 2);
        assert_eq!(first.status(), InstanceStatus::Up);
        assert_eq!(
            first.ports().iter().next().map(|p| p.port),
            Some(8761)
        );
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_record() {
        let reg = self_registration();
        let (a, b) = tokio::join!(reg.register(), reg.register());
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(reg.coordinator.store().len(), 1);
    }

    #[tokio::test]
    async fn test_own_instance_excluded_from_access_count() {
        let reg = self_registration();
        reg.register().await.unwrap();
        assert!(!reg.coordinator.should_allow_access(false));
    }

    #[tokio::test]
    async fn test_renew_reregisters_after_eviction() {
        let reg = self_registration();
        let record = reg.register().await.unwrap();
        reg.coordinator
            .store()
            .evict_if_version(record.id(), 2, 0)
            .unwrap();

        reg.renew_once(&record).await;
        assert_eq!(reg.coordinator.latest_version(record.id()), Some(3));
    }

    #[tokio::test]
    async fn test_peers_see_starting_then_up() {
        let peer = Arc::new(RecordingPeer::default());
        let reg = self_registration_with(vec![peer.clone() as Arc<dyn PeerClient>]);
        let record = reg.register().await.unwrap();

        let sent = peer.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        match &sent[0] {
            ReplicationMessage::Register { instance } => {
                assert_eq!(instance.status(), InstanceStatus::Starting);
                assert_eq!(instance.version(), 1);
            }
            other => panic!("expected register, got {:?}", other),
        }
        assert_eq!(
            sent[1],
            ReplicationMessage::StatusUpdate {
                id: record.id().clone(),
                status: InstanceStatus::Up,
                version: 2,
            }
        );
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("ws://10.0.0.1:8761"), ("10.0.0.1".into(), 8761));
        assert_eq!(split_host_port("0.0.0.0:8761"), ("0.0.0.0".into(), 8761));
        assert_eq!(split_host_port("ws://host/path"), ("host".into(), 0));
        assert_eq!(split_host_port("ws://[::1]:9000"), ("::1".into(), 9000));
    }
}
