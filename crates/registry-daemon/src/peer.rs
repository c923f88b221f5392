//! Outgoing connections to peer registry servers.
//!
//! Each peer gets one lazily-opened WebSocket connection carrying one
//! request at a time. A failed request drops the connection and schedules
//! the next connect attempt with exponential backoff; requests made before
//! then fail fast instead of stalling replication.

use crate::connection::{next_data_frame, send_binary};
use async_trait::async_trait;
use registry_core::protocol::{Handshake, HandshakeRole};
use registry_core::{
    Clock, InstanceRecord, ReplicationMessage, ReplicationReply, ServerId, TransportError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type PeerStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Configuration for retry and reconnect behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Initial delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum number of attempts where a caller retries in a loop
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            max_attempts: Some(3),
        }
    }
}

impl ReconnectConfig {
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            ..Default::default()
        }
    }
}

/// Calculates the next delay using exponential backoff.
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let delay_secs = config.initial_delay.as_secs_f64()
        * config.backoff_factor.powi(attempt.saturating_sub(1) as i32);

    Duration::from_secs_f64(delay_secs.min(config.max_delay.as_secs_f64()))
}

/// Reconnection state for a peer.
#[derive(Debug, Clone, Default)]
pub struct ReconnectState {
    /// Consecutive failed attempts
    pub attempts: u32,
    /// Earliest time for the next connect attempt (ms)
    pub next_attempt_at: Option<u64>,
}

impl ReconnectState {
    pub fn schedule_reconnect(&mut self, now_ms: u64, config: &ReconnectConfig) {
        self.attempts += 1;
        let delay = calculate_backoff(self.attempts, config);
        self.next_attempt_at = Some(now_ms + delay.as_millis() as u64);
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.next_attempt_at = None;
    }

    pub fn should_reconnect(&self, now_ms: u64) -> bool {
        self.next_attempt_at.is_none_or(|t| now_ms >= t)
    }
}

/// A peer registry server, as seen by the replication coordinator.
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// How the peer shows up in logs.
    fn label(&self) -> &str;

    async fn replicate(&self, msg: &ReplicationMessage) -> Result<ReplicationReply, TransportError>;

    /// Full copy of the peer's registry, with the peer's server ID.
    async fn fetch_snapshot(&self) -> Result<(ServerId, Vec<InstanceRecord>), TransportError> {
        match self.replicate(&ReplicationMessage::FetchSnapshot).await? {
            ReplicationReply::Snapshot {
                server_id,
                instances,
            } => Ok((server_id, instances)),
            ReplicationReply::Error { reason } => Err(TransportError::Other(reason)),
            other => Err(TransportError::Codec(format!(
                "unexpected reply to snapshot request: {:?}",
                other
            ))),
        }
    }
}

struct PeerState {
    conn: Option<PeerStream>,
    remote_id: Option<ServerId>,
    reconnect: ReconnectState,
}

/// WebSocket connection to one peer.
pub struct WsPeerClient {
    url: String,
    our_id: ServerId,
    config: ReconnectConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<PeerState>,
}

impl WsPeerClient {
    pub fn new(url: String, our_id: ServerId, config: ReconnectConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            url,
            our_id,
            config,
            clock,
            state: Mutex::new(PeerState {
                conn: None,
                remote_id: None,
                reconnect: ReconnectState::default(),
            }),
        }
    }

    /// Server ID the peer announced in its last handshake.
    pub async fn remote_id(&self) -> Option<ServerId> {
        self.state.lock().await.remote_id.clone()
    }

    async fn connect(&self) -> Result<(PeerStream, ServerId), TransportError> {
        let (mut ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", self.url, e)))?;

        send_binary(&mut ws, Handshake::peer(self.our_id.clone()).to_json()?).await?;

        let data = next_data_frame(&mut ws, &self.url).await?;
        let handshake = Handshake::from_json(&data)
            .ok_or_else(|| TransportError::Codec("expected handshake from peer".to_string()))?;
        if handshake.should_warn_version() {
            warn!(
                "Peer {} speaks protocol version {}, ours is {}",
                self.url,
                handshake.version,
                registry_core::protocol::PROTOCOL_VERSION
            );
        }
        match (handshake.role, handshake.server_id) {
            (HandshakeRole::Server, Some(remote_id)) => Ok((ws, remote_id)),
            (role, _) => Err(TransportError::Codec(format!(
                "peer {} answered with role {:?} and no server id",
                self.url, role
            ))),
        }
    }

    async fn exchange(
        &self,
        ws: &mut PeerStream,
        msg: &ReplicationMessage,
    ) -> Result<ReplicationReply, TransportError> {
        send_binary(ws, msg.encode()?).await?;
        let data = next_data_frame(ws, &self.url).await?;
        Ok(ReplicationReply::decode(&data)?)
    }
}

#[async_trait]
impl PeerClient for WsPeerClient {
    fn label(&self) -> &str {
        &self.url
    }

    async fn replicate(&self, msg: &ReplicationMessage) -> Result<ReplicationReply, TransportError> {
        let mut state = self.state.lock().await;

        // Taken out for the duration of the exchange: if the caller's timeout
        // cancels us mid-request the half-used connection is dropped with it.
        let mut ws = match state.conn.take() {
            Some(ws) => ws,
            None => {
                let now = self.clock.now_ms();
                if !state.reconnect.should_reconnect(now) {
                    return Err(TransportError::ConnectionFailed(format!(
                        "{} unreachable, next attempt in {}ms",
                        self.url,
                        state.reconnect.next_attempt_at.unwrap_or(now).saturating_sub(now)
                    )));
                }
                // Scheduled before connecting: a caller timing out mid-connect
                // drops this future, and the peer must still be backed off
                state.reconnect.schedule_reconnect(now, &self.config);
                match self.connect().await {
                    Ok((ws, remote_id)) => {
                        info!("Connected to peer {} ({})", self.url, remote_id);
                        state.remote_id = Some(remote_id);
                        state.reconnect.reset();
                        ws
                    }
                    Err(e) => {
                        debug!(
                            "Connect to {} failed (attempt {}): {}",
                            self.url, state.reconnect.attempts, e
                        );
                        return Err(e);
                    }
                }
            }
        };

        match self.exchange(&mut ws, msg).await {
            Ok(reply) => {
                state.conn = Some(ws);
                Ok(reply)
            }
            Err(e) => {
                state
                    .reconnect
                    .schedule_reconnect(self.clock.now_ms(), &self.config);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            max_attempts: Some(10),
        };
        assert_eq!(calculate_backoff(1, &config), Duration::from_secs(1));
        assert_eq!(calculate_backoff(2, &config), Duration::from_secs(2));
        assert_eq!(calculate_backoff(3, &config), Duration::from_secs(4));
        assert_eq!(calculate_backoff(4, &config), Duration::from_secs(5));
    }

    #[test]
    fn test_reconnect_state() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_secs(1),
            ..Default::default()
        };
        let mut state = ReconnectState::default();
        assert!(state.should_reconnect(0));

        state.schedule_reconnect(10_000, &config);
        assert!(!state.should_reconnect(10_999));
        assert!(state.should_reconnect(11_000));

        state.schedule_reconnect(11_000, &config);
        assert_eq!(state.next_attempt_at, Some(13_000));

        state.reset();
        assert!(state.should_reconnect(0));
    }

    #[tokio::test]
    async fn test_unreachable_peer_fails_fast_during_backoff() {
        let clock = Arc::new(registry_core::ManualClock::new(0));
        let client = WsPeerClient::new(
            // Nothing listens on port 1
            "ws://127.0.0.1:1".to_string(),
            "registry-a".parse().unwrap(),
            ReconnectConfig::default(),
            clock.clone(),
        );

        let first = client.replicate(&ReplicationMessage::FetchSnapshot).await;
        assert!(matches!(first, Err(TransportError::ConnectionFailed(_))));

        let second = client.replicate(&ReplicationMessage::FetchSnapshot).await;
        match second {
            Err(TransportError::ConnectionFailed(reason)) => {
                assert!(reason.contains("next attempt"))
            }
            other => panic!("expected fail-fast, got {:?}", other),
        }
        assert!(client.remote_id().await.is_none());
    }

    #[tokio::test]
    async fn test_abandoned_connect_still_backs_off() {
        // Accepts TCP through the backlog but never answers the upgrade
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let clock = Arc::new(registry_core::ManualClock::new(0));
        let client = WsPeerClient::new(
            url,
            "registry-a".parse().unwrap(),
            ReconnectConfig::default(),
            clock.clone(),
        );

        let first = tokio::time::timeout(
            Duration::from_millis(200),
            client.replicate(&ReplicationMessage::FetchSnapshot),
        )
        .await;
        assert!(first.is_err(), "connect should hang");

        let second = tokio::time::timeout(
            Duration::from_millis(200),
            client.replicate(&ReplicationMessage::FetchSnapshot),
        )
        .await;
        match second {
            Ok(Err(TransportError::ConnectionFailed(reason))) => {
                assert!(reason.contains("next attempt"))
            }
            other => panic!("expected fail-fast, got {:?}", other),
        }

        clock.advance(Duration::from_millis(500));
        let third = tokio::time::timeout(
            Duration::from_millis(200),
            client.replicate(&ReplicationMessage::FetchSnapshot),
        )
        .await;
        assert!(third.is_err(), "backoff elapsed, so a real attempt is made");
        drop(listener);
    }
}
