//! Transport seam between the registration channel and the connection.
//!
//! The core never touches sockets. A channel replies through a `ReplySink`
//! the daemon implements over its WebSocket write half.

use crate::protocol::ServerMessage;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Connection closed")]
    Closed,
    #[error("Timed out after {0}ms")]
    Timeout(u64),
    #[error("Codec error: {0}")]
    Codec(String),
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        TransportError::Codec(e.to_string())
    }
}

impl From<bincode::Error> for TransportError {
    fn from(e: bincode::Error) -> Self {
        TransportError::Codec(e.to_string())
    }
}

/// Where a registration channel sends its replies.
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn send_reply(&self, reply: ServerMessage) -> Result<(), TransportError>;
}
