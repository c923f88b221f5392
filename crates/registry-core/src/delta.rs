//! Field-level differences between two versions of one instance record.
//!
//! An update is replicated as its deltas plus the new version, so peers only
//! receive what changed.

use crate::instance::{DataCenterInfo, InstanceStatus, LeaseSettings, ServicePort};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// One changed field with its new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Delta {
    App(String),
    VipAddress(Option<String>),
    DataCenter(DataCenterInfo),
    Ports(BTreeSet<ServicePort>),
    HealthCheckUrls(BTreeSet<String>),
    Status(InstanceStatus),
    Lease(LeaseSettings),
}

/// Which field a delta touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeltaField {
    App,
    VipAddress,
    DataCenter,
    Ports,
    HealthCheckUrls,
    Status,
    Lease,
}

impl Delta {
    pub fn field(&self) -> DeltaField {
        match self {
            Delta::App(_) => DeltaField::App,
            Delta::VipAddress(_) => DeltaField::VipAddress,
            Delta::DataCenter(_) => DeltaField::DataCenter,
            Delta::Ports(_) => DeltaField::Ports,
            Delta::HealthCheckUrls(_) => DeltaField::HealthCheckUrls,
            Delta::Status(_) => DeltaField::Status,
            Delta::Lease(_) => DeltaField::Lease,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_mapping() {
        assert_eq!(Delta::App("x".into()).field(), DeltaField::App);
        assert_eq!(Delta::Status(InstanceStatus::Up).field(), DeltaField::Status);
        assert_eq!(
            Delta::Ports(BTreeSet::from([ServicePort::new("http", 80)])).field(),
            DeltaField::Ports
        );
    }

    #[test]
    fn test_json_shape() {
        let delta = Delta::Status(InstanceStatus::OutOfService);
        let json = serde_json::to_string(&delta).unwrap();
        assert_eq!(json, r#"{"status":"outOfService"}"#);
    }
}
