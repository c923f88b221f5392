//! Versioned handshake protocol.
//!
//! The handshake is the first frame in each direction after the WebSocket
//! connection is established. It carries:
//! - Protocol version for forward compatibility
//! - Role, which decides how the rest of the connection is handled
//! - Server ID (set by registry servers, absent for plain clients)

use crate::server_id::ServerId;
use serde::{Deserialize, Serialize};

/// Current protocol version.
///
/// Increment when making breaking changes to the protocol.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum message size (1 MiB).
///
/// Frames larger than this are dropped by the read loops.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// What the sender of a handshake is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HandshakeRole {
    /// Service instance registering itself
    Client,
    /// Another registry server replicating into this one
    Peer,
    /// The registry server answering a connection
    Server,
}

/// Versioned handshake message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    /// Message type discriminator
    #[serde(rename = "type")]
    pub msg_type: String,
    /// Protocol version
    pub version: u32,
    /// Role in the connection
    pub role: HandshakeRole,
    /// Identity of the sending registry server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<ServerId>,
}

impl Handshake {
    pub fn new(role: HandshakeRole, server_id: Option<ServerId>) -> Self {
        Self {
            msg_type: "handshake".to_string(),
            version: PROTOCOL_VERSION,
            role,
            server_id,
        }
    }

    /// Handshake sent by a service instance.
    pub fn client() -> Self {
        Self::new(HandshakeRole::Client, None)
    }

    /// Handshake sent by a registry server opening a replication connection.
    pub fn peer(server_id: ServerId) -> Self {
        Self::new(HandshakeRole::Peer, Some(server_id))
    }

    /// Handshake a registry server answers every connection with.
    pub fn server(server_id: ServerId) -> Self {
        Self::new(HandshakeRole::Server, Some(server_id))
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse a handshake, rejecting JSON that is some other message.
    pub fn from_json(data: &[u8]) -> Option<Self> {
        let handshake: Self = serde_json::from_slice(data).ok()?;

        if handshake.msg_type == "handshake" {
            Some(handshake)
        } else {
            None
        }
    }

    pub fn should_warn_version(&self) -> bool {
        self.version != PROTOCOL_VERSION
    }

    /// Peer handshakes must say which server they come from.
    pub fn is_valid(&self) -> bool {
        match self.role {
            HandshakeRole::Client => true,
            HandshakeRole::Peer | HandshakeRole::Server => self.server_id.is_some(),
        }
    }
}
