//! Leases: an instance record plus the timing that keeps it alive.

use crate::instance::InstanceRecord;
use crate::source::Source;
use std::sync::Arc;

/// Time-bounded claim that an instance is alive.
///
/// Owned by the `LeaseStore`; everything outside the store sees clones.
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    record: Arc<InstanceRecord>,
    source: Source,
    /// When the identity was first registered (ms)
    registration_timestamp: u64,
    /// Last renewal, registration or update (ms)
    last_renewal_timestamp: u64,
    /// Set once the lease has been evicted
    eviction_timestamp: Option<u64>,
    duration_secs: u32,
}

impl Lease {
    pub fn new(record: Arc<InstanceRecord>, source: Source, now_ms: u64) -> Self {
        let duration_secs = record.lease().duration_secs;
        Self {
            record,
            source,
            registration_timestamp: now_ms,
            last_renewal_timestamp: now_ms,
            eviction_timestamp: None,
            duration_secs,
        }
    }

    pub fn record(&self) -> &Arc<InstanceRecord> {
        &self.record
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn version(&self) -> u64 {
        self.record.version()
    }

    pub fn registration_timestamp(&self) -> u64 {
        self.registration_timestamp
    }

    pub fn last_renewal_timestamp(&self) -> u64 {
        self.last_renewal_timestamp
    }

    pub fn eviction_timestamp(&self) -> Option<u64> {
        self.eviction_timestamp
    }

    pub fn duration_secs(&self) -> u32 {
        self.duration_secs
    }

    /// First instant (ms) at which the lease counts as expired.
    pub fn expires_at(&self) -> u64 {
        self.last_renewal_timestamp + u64::from(self.duration_secs) * 1000
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.eviction_timestamp.is_some() || now_ms >= self.expires_at()
    }

    pub fn renew(&mut self, now_ms: u64) {
        self.last_renewal_timestamp = self.last_renewal_timestamp.max(now_ms);
    }

    /// Swap in a newer record. A write from the owner also counts as a renewal.
    pub fn replace(&mut self, record: Arc<InstanceRecord>, source: Source, now_ms: u64) {
        self.duration_secs = record.lease().duration_secs;
        self.record = record;
        self.source = source;
        self.renew(now_ms);
    }

    pub fn mark_evicted(&mut self, now_ms: u64) {
        self.eviction_timestamp = Some(now_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease_at(now_ms: u64) -> Lease {
        let record = InstanceRecord::builder("a", "app").lease(90, 30).build();
        Lease::new(Arc::new(record), Source::Local, now_ms)
    }

    #[test]
    fn test_expiry_boundary() {
        let lease = lease_at(1_000);
        assert_eq!(lease.expires_at(), 91_000);
        assert!(!lease.is_expired(90_999));
        assert!(lease.is_expired(91_000));
    }

    #[test]
    fn test_renew_extends() {
        let mut lease = lease_at(1_000);
        lease.renew(50_000);
        assert!(!lease.is_expired(91_000));
        assert!(lease.is_expired(140_000));
        assert_eq!(lease.registration_timestamp(), 1_000);
    }

    #[test]
    fn test_renew_never_moves_backwards() {
        let mut lease = lease_at(10_000);
        lease.renew(5_000);
        assert_eq!(lease.last_renewal_timestamp(), 10_000);
    }

    #[test]
    fn test_replace_picks_up_new_duration() {
        let mut lease = lease_at(0);
        let record = InstanceRecord::builder("a", "app")
            .lease(10, 5)
            .version(2)
            .build();
        lease.replace(Arc::new(record), Source::Local, 1_000);
        assert_eq!(lease.duration_secs(), 10);
        assert_eq!(lease.expires_at(), 11_000);
        assert_eq!(lease.version(), 2);
    }

    #[test]
    fn test_evicted_lease_is_expired() {
        let mut lease = lease_at(0);
        lease.mark_evicted(1);
        assert!(lease.is_expired(2));
        assert_eq!(lease.eviction_timestamp(), Some(1));
    }
}
