//! Instance records: what a registered service instance looks like.
//!
//! Records are immutable. Changing anything (including the version) goes
//! through a consuming `with_*` method or a builder and yields a new record.

use crate::delta::Delta;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::{self, Display, Formatter};

/// Default lease duration when the instance does not declare one.
pub const DEFAULT_LEASE_DURATION_SECS: u32 = 90;

/// Default renewal interval when the instance does not declare one.
pub const DEFAULT_RENEWAL_INTERVAL_SECS: u32 = 30;

/// Identity of a registered instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for InstanceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Operational status reported by the instance (or overridden by an operator).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InstanceStatus {
    Up,
    Down,
    Starting,
    OutOfService,
    #[default]
    Unknown,
}

/// A named port the instance serves on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    pub name: String,
    pub port: u16,
    #[serde(default)]
    pub secure: bool,
}

impl ServicePort {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
            secure: false,
        }
    }
}

/// One network address of the host running the instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkAddress {
    pub ip: String,
    #[serde(default)]
    pub host_name: Option<String>,
    /// Reachable from outside the data center
    #[serde(default)]
    pub public: bool,
}

impl NetworkAddress {
    pub fn private(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            host_name: None,
            public: false,
        }
    }

    pub fn public(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            host_name: None,
            public: true,
        }
    }

    /// Host name if known, otherwise the IP.
    pub fn name_or_ip(&self) -> &str {
        self.host_name.as_deref().unwrap_or(&self.ip)
    }
}

/// Where the instance runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataCenterInfo {
    pub name: String,
    #[serde(default)]
    pub addresses: Vec<NetworkAddress>,
}

impl DataCenterInfo {
    pub fn new(name: impl Into<String>, addresses: Vec<NetworkAddress>) -> Self {
        Self {
            name: name.into(),
            addresses,
        }
    }

    /// Public address first, then any address.
    pub fn preferred_address(&self) -> Option<&NetworkAddress> {
        self.addresses
            .iter()
            .find(|a| a.public)
            .or_else(|| self.addresses.first())
    }
}

/// Lease terms declared by the instance at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseSettings {
    /// Time-to-live since the last renewal
    pub duration_secs: u32,
    /// How often the instance promises to renew
    pub renewal_interval_secs: u32,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            duration_secs: DEFAULT_LEASE_DURATION_SECS,
            renewal_interval_secs: DEFAULT_RENEWAL_INTERVAL_SECS,
        }
    }
}

impl LeaseSettings {
    /// Renewals this instance should produce per minute.
    pub fn expected_renewals_per_min(&self) -> f64 {
        if self.renewal_interval_secs == 0 {
            return 0.0;
        }
        60.0 / self.renewal_interval_secs as f64
    }
}

/// A registered service instance at a specific version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    id: InstanceId,
    app: String,
    #[serde(default)]
    vip_address: Option<String>,
    #[serde(default)]
    data_center: DataCenterInfo,
    #[serde(default)]
    ports: BTreeSet<ServicePort>,
    #[serde(default)]
    health_check_urls: BTreeSet<String>,
    #[serde(default)]
    status: InstanceStatus,
    #[serde(default)]
    lease: LeaseSettings,
    /// Assigned by the registry; whatever the client sends is overwritten
    #[serde(default)]
    version: u64,
}

impl InstanceRecord {
    pub fn builder(id: impl Into<String>, app: impl Into<String>) -> InstanceRecordBuilder {
        InstanceRecordBuilder::new(id, app)
    }

    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn vip_address(&self) -> Option<&str> {
        self.vip_address.as_deref()
    }

    pub fn data_center(&self) -> &DataCenterInfo {
        &self.data_center
    }

    pub fn ports(&self) -> &BTreeSet<ServicePort> {
        &self.ports
    }

    pub fn health_check_urls(&self) -> &BTreeSet<String> {
        &self.health_check_urls
    }

    pub fn status(&self) -> InstanceStatus {
        self.status
    }

    pub fn lease(&self) -> LeaseSettings {
        self.lease
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn with_status(mut self, status: InstanceStatus) -> Self {
        self.status = status;
        self
    }

    /// Start a builder pre-filled with this record's fields.
    pub fn to_builder(&self) -> InstanceRecordBuilder {
        InstanceRecordBuilder {
            record: self.clone(),
        }
    }

    /// Field-level differences between this record and an older version of
    /// the same identity. The version itself is not a delta.
    pub fn diff_older(&self, older: &InstanceRecord) -> Vec<Delta> {
        let mut deltas = Vec::new();
        if self.app != older.app {
            deltas.push(Delta::App(self.app.clone()));
        }
        if self.vip_address != older.vip_address {
            deltas.push(Delta::VipAddress(self.vip_address.clone()));
        }
        if self.data_center != older.data_center {
            deltas.push(Delta::DataCenter(self.data_center.clone()));
        }
        if self.ports != older.ports {
            deltas.push(Delta::Ports(self.ports.clone()));
        }
        if self.health_check_urls != older.health_check_urls {
            deltas.push(Delta::HealthCheckUrls(self.health_check_urls.clone()));
        }
        if self.status != older.status {
            deltas.push(Delta::Status(self.status));
        }
        if self.lease != older.lease {
            deltas.push(Delta::Lease(self.lease));
        }
        deltas
    }

    /// Produce the newer record described by `deltas` at `version`.
    pub fn apply_deltas(&self, deltas: &[Delta], version: u64) -> InstanceRecord {
        let mut next = self.clone();
        for delta in deltas {
            match delta {
                Delta::App(app) => next.app = app.clone(),
                Delta::VipAddress(vip) => next.vip_address = vip.clone(),
                Delta::DataCenter(dc) => next.data_center = dc.clone(),
                Delta::Ports(ports) => next.ports = ports.clone(),
                Delta::HealthCheckUrls(urls) => next.health_check_urls = urls.clone(),
                Delta::Status(status) => next.status = *status,
                Delta::Lease(lease) => next.lease = *lease,
            }
        }
        next.version = version;
        next
    }

    /// Check the record is acceptable for the store.
    ///
    /// Returns a human-readable reason on failure.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("instance id is empty".to_string());
        }
        if self.app.is_empty() {
            return Err(format!("instance {} has no app name", self.id));
        }
        if self.lease.duration_secs == 0 {
            return Err(format!("instance {} declares a zero lease duration", self.id));
        }
        if self.lease.renewal_interval_secs == 0
            || self.lease.renewal_interval_secs > self.lease.duration_secs
        {
            return Err(format!(
                "instance {} renewal interval {}s must be between 1 and the lease duration {}s",
                self.id, self.lease.renewal_interval_secs, self.lease.duration_secs
            ));
        }
        Ok(())
    }
}

/// Builder for `InstanceRecord`.
#[derive(Debug, Clone)]
pub struct InstanceRecordBuilder {
    record: InstanceRecord,
}

impl InstanceRecordBuilder {
    pub fn new(id: impl Into<String>, app: impl Into<String>) -> Self {
        Self {
            record: InstanceRecord {
                id: InstanceId::new(id),
                app: app.into(),
                vip_address: None,
                data_center: DataCenterInfo::default(),
                ports: BTreeSet::new(),
                health_check_urls: BTreeSet::new(),
                status: InstanceStatus::Unknown,
                lease: LeaseSettings::default(),
                version: 0,
            },
        }
    }

    pub fn app(mut self, app: impl Into<String>) -> Self {
        self.record.app = app.into();
        self
    }

    pub fn vip_address(mut self, vip: impl Into<String>) -> Self {
        self.record.vip_address = Some(vip.into());
        self
    }

    pub fn data_center(mut self, dc: DataCenterInfo) -> Self {
        self.record.data_center = dc;
        self
    }

    pub fn port(mut self, port: ServicePort) -> Self {
        self.record.ports.insert(port);
        self
    }

    pub fn ports(mut self, ports: impl IntoIterator<Item = ServicePort>) -> Self {
        self.record.ports = ports.into_iter().collect();
        self
    }

    pub fn health_check_url(mut self, url: impl Into<String>) -> Self {
        self.record.health_check_urls.insert(url.into());
        self
    }

    pub fn status(mut self, status: InstanceStatus) -> Self {
        self.record.status = status;
        self
    }

    pub fn lease(mut self, duration_secs: u32, renewal_interval_secs: u32) -> Self {
        self.record.lease = LeaseSettings {
            duration_secs,
            renewal_interval_secs,
        };
        self
    }

    pub fn version(mut self, version: u64) -> Self {
        self.record.version = version;
        self
    }

    pub fn build(self) -> InstanceRecord {
        self.record
    }
}
