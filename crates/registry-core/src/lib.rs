//! registry-core: lease lifecycle and registration state for the service registry.
//!
//! This crate provides the runtime-agnostic pieces of a registry server:
//! - Immutable instance records, field-level deltas and leases
//! - The lease store with per-identity version compare-and-set
//! - Self-preservation counters and the eviction pass
//! - The per-connection registration channel state machine
//! - Wire protocol types for clients and peer replication

pub mod access;
pub mod channel;
pub mod clock;
pub mod delta;
pub mod eviction;
pub mod instance;
pub mod lease;
pub mod protocol;
pub mod registry;
pub mod self_preservation;
pub mod server_id;
pub mod source;
pub mod store;
pub mod transport;

pub use access::AccessGate;
pub use channel::{ChannelError, ChannelMetrics, ChannelState, RegistrationChannel};
pub use clock::{Clock, ManualClock, SystemClock};
pub use delta::{Delta, DeltaField};
pub use eviction::{EvictionOutcome, EvictionQueue, QueuedEviction};
pub use instance::{
    DataCenterInfo, InstanceId, InstanceRecord, InstanceRecordBuilder, InstanceStatus,
    LeaseSettings, NetworkAddress, ServicePort,
};
pub use lease::Lease;
pub use protocol::{
    ClientMessage, Handshake, HandshakeRole, ReplicationMessage, ReplicationReply, ServerMessage,
};
pub use registry::{InstanceRegistry, LocalRegistry, RegistryError};
pub use self_preservation::{SelfPreservation, SelfPreservationConfig, Verdict};
pub use server_id::{ServerId, ServerIdError};
pub use source::Source;
pub use store::{LeaseStore, MutationResult, Status, StoreError};
pub use transport::{ReplySink, TransportError};
