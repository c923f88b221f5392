//! Peer replication messages (bincode).
//!
//! One request, one reply. The origin of a request is the server ID from the
//! connection's handshake, so messages do not repeat it.

use crate::delta::Delta;
use crate::instance::{InstanceId, InstanceRecord, InstanceStatus};
use crate::server_id::ServerId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationMessage {
    Register {
        instance: InstanceRecord,
    },
    /// Changed fields only, applied on top of the receiver's stored record
    /// when that record is at `base_version`
    Update {
        id: InstanceId,
        base_version: u64,
        version: u64,
        deltas: Vec<Delta>,
    },
    Unregister {
        id: InstanceId,
        version: u64,
    },
    StatusUpdate {
        id: InstanceId,
        status: InstanceStatus,
        version: u64,
    },
    Heartbeat {
        id: InstanceId,
    },
    FetchSnapshot,
}

impl ReplicationMessage {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ReplicationMessage::Register { .. } => "register",
            ReplicationMessage::Update { .. } => "update",
            ReplicationMessage::Unregister { .. } => "unregister",
            ReplicationMessage::StatusUpdate { .. } => "statusUpdate",
            ReplicationMessage::Heartbeat { .. } => "heartbeat",
            ReplicationMessage::FetchSnapshot => "fetchSnapshot",
        }
    }

    /// The instance this message is about.
    pub fn instance_id(&self) -> Option<&InstanceId> {
        match self {
            ReplicationMessage::Register { instance } => Some(instance.id()),
            ReplicationMessage::Update { id, .. }
            | ReplicationMessage::Unregister { id, .. }
            | ReplicationMessage::StatusUpdate { id, .. }
            | ReplicationMessage::Heartbeat { id } => Some(id),
            ReplicationMessage::FetchSnapshot => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationReply {
    Ack,
    Snapshot {
        server_id: ServerId,
        instances: Vec<InstanceRecord>,
    },
    /// Receiver has no lease for this instance; the sender should register it
    UnknownInstance {
        id: InstanceId,
    },
    /// Receiver's copy is not the version the deltas were computed against;
    /// the sender should register the full record
    Stale {
        id: InstanceId,
    },
    Error {
        reason: String,
    },
}

impl ReplicationReply {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}
