//! WebSocket plumbing shared by client sessions, peer sessions and peer clients.
//!
//! - Frame extraction with the size limit
//! - A read loop forwarding frames over an mpsc channel
//! - The reply sink registration channels write through
//! - Heartbeat bookkeeping for connection liveness

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{Sink, SinkExt, Stream, StreamExt};
use registry_core::protocol::MAX_MESSAGE_SIZE;
use registry_core::{ReplySink, ServerMessage, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, warn};

/// Server side of an accepted connection.
pub type ServerStream = WebSocketStream<TcpStream>;
pub type ServerWrite = SplitSink<ServerStream, Message>;
pub type ServerRead = SplitStream<ServerStream>;

/// What one WebSocket message amounts to.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    Data(Vec<u8>),
    /// Control or oversized frame, nothing to hand on
    Skip,
    Close,
}

impl Frame {
    pub fn from_message(msg: Message, conn_id: &str) -> Self {
        let data = match msg {
            Message::Binary(data) => data,
            Message::Text(text) => text.into_bytes(),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => return Frame::Skip,
            Message::Close(_) => {
                debug!("Received close frame from {}", conn_id);
                return Frame::Close;
            }
        };

        if data.len() > MAX_MESSAGE_SIZE {
            warn!(
                "Message from {} exceeds max size ({} > {}), dropping",
                conn_id,
                data.len(),
                MAX_MESSAGE_SIZE
            );
            return Frame::Skip;
        }
        Frame::Data(data)
    }
}

/// Wait for the next data frame on `stream`.
pub async fn next_data_frame<S>(stream: &mut S, conn_id: &str) -> Result<Vec<u8>, TransportError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        match stream.next().await {
            Some(Ok(msg)) => match Frame::from_message(msg, conn_id) {
                Frame::Data(data) => return Ok(data),
                Frame::Skip => continue,
                Frame::Close => return Err(TransportError::Closed),
            },
            Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                return Err(TransportError::Closed);
            }
            Some(Err(e)) => return Err(TransportError::ConnectionFailed(e.to_string())),
        }
    }
}

/// Send `data` as one binary frame.
pub async fn send_binary<S>(sink: &mut S, data: Vec<u8>) -> Result<(), TransportError>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    sink.send(Message::Binary(data))
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()))
}

/// Forward data frames from `read` into `tx` until the connection ends.
///
/// Dropping the sender is the close signal for the receiving side.
pub async fn read_loop(conn_id: String, mut read: ServerRead, tx: mpsc::UnboundedSender<Vec<u8>>) {
    loop {
        match read.next().await {
            Some(Ok(msg)) => match Frame::from_message(msg, &conn_id) {
                Frame::Data(data) => {
                    if tx.send(data).is_err() {
                        break;
                    }
                }
                Frame::Skip => continue,
                Frame::Close => break,
            },
            Some(Err(e)) => {
                match e {
                    WsError::ConnectionClosed | WsError::AlreadyClosed => {
                        debug!("Connection {} closed", conn_id);
                    }
                    _ => {
                        error!("WebSocket error on {}: {}", conn_id, e);
                    }
                }
                break;
            }
            None => {
                debug!("Connection {} stream ended", conn_id);
                break;
            }
        }
    }
}

/// Registration-channel replies written to the connection as JSON frames.
pub struct WsReplySink {
    write: Arc<Mutex<ServerWrite>>,
}

impl WsReplySink {
    pub fn new(write: Arc<Mutex<ServerWrite>>) -> Self {
        Self { write }
    }
}

#[async_trait]
impl ReplySink for WsReplySink {
    async fn send_reply(&self, reply: ServerMessage) -> Result<(), TransportError> {
        let data = reply.to_json()?;
        let mut write = self.write.lock().await;
        send_binary(&mut *write, data).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    /// Consecutive silent intervals before the connection is considered dead
    pub max_misses: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_misses: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Dead,
}

/// Counts heartbeat intervals in which nothing arrived from the remote side.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    misses: u32,
    heard_since_tick: bool,
}

impl HeartbeatMonitor {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            misses: 0,
            heard_since_tick: false,
        }
    }

    pub fn interval(&self) -> Duration {
        self.config.interval
    }

    pub fn misses(&self) -> u32 {
        self.misses
    }

    /// Any inbound frame counts as a sign of life.
    pub fn on_frame(&mut self) {
        self.heard_since_tick = true;
    }

    pub fn on_tick(&mut self) -> Liveness {
        if self.heard_since_tick {
            self.misses = 0;
        } else {
            self.misses += 1;
        }
        self.heard_since_tick = false;

        if self.misses >= self.config.max_misses {
            Liveness::Dead
        } else {
            Liveness::Alive
        }
    }
}
