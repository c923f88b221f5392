//! Wire protocol for the registry.
//!
//! Every connection opens with a JSON handshake naming its role:
//! - **client** connections then exchange JSON `ClientMessage` / `ServerMessage` frames
//! - **peer** connections then exchange bincode `ReplicationMessage` / `ReplicationReply` frames

pub mod client;
pub mod handshake;
pub mod replication;

pub use client::{ClientMessage, ServerMessage};
pub use handshake::{Handshake, HandshakeRole, MAX_MESSAGE_SIZE, PROTOCOL_VERSION};
pub use replication::{ReplicationMessage, ReplicationReply};
