//! WebSocket server accepting clients and peers.
//!
//! Every connection starts with a handshake in both directions. The role in
//! the remote handshake decides what the connection becomes:
//! - `client`: a registration channel with heartbeat supervision
//! - `peer`: a replication endpoint answering bincode requests

use crate::connection::{
    read_loop, send_binary, HeartbeatConfig, HeartbeatMonitor, Liveness, ServerWrite, WsReplySink,
};
use crate::replication::ReplicationCoordinator;
use futures::{SinkExt, StreamExt};
use registry_core::protocol::{Handshake, HandshakeRole};
use registry_core::{
    ChannelMetrics, ChannelState, Clock, EvictionQueue, RegistrationChannel, ReplicationMessage,
    ReplicationReply, ReplySink, ServerId, ServerMessage,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// How long a new connection has to send its handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct RegistryServer {
    server_id: ServerId,
    coordinator: Arc<ReplicationCoordinator>,
    eviction: Arc<EvictionQueue>,
    clock: Arc<dyn Clock>,
    metrics: Arc<ChannelMetrics>,
    heartbeat: HeartbeatConfig,
    next_conn_id: AtomicU64,
    sessions: AtomicUsize,
}

/// Decrements the session count when a connection handler finishes.
struct SessionGuard<'a>(&'a AtomicUsize);

impl<'a> SessionGuard<'a> {
    fn enter(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        SessionGuard(count)
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RegistryServer {
    pub fn new(
        coordinator: Arc<ReplicationCoordinator>,
        eviction: Arc<EvictionQueue>,
        clock: Arc<dyn Clock>,
        metrics: Arc<ChannelMetrics>,
        heartbeat: HeartbeatConfig,
    ) -> Self {
        Self {
            server_id: coordinator.server_id().clone(),
            coordinator,
            eviction,
            clock,
            metrics,
            heartbeat,
            next_conn_id: AtomicU64::new(1),
            sessions: AtomicUsize::new(0),
        }
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> std::io::Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("Registry listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Connections currently being handled (handshaking, clients and peers).
    pub fn session_count(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> &Arc<ChannelMetrics> {
        &self.metrics
    }

    /// Accept connections forever, one task per connection.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        server.handle_connection(stream, addr).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let ws_stream = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                // Health checks connect and close without a WebSocket upgrade
                let err_str = e.to_string();
                if err_str.contains("Handshake not finished")
                    || err_str.contains("Connection reset")
                    || err_str.contains("unexpected EOF")
                {
                    debug!("Connection closed before handshake from {}", addr);
                } else {
                    error!("WebSocket upgrade failed for {}: {}", addr, e);
                }
                return;
            }
        };

        let _session = SessionGuard::enter(&self.sessions);
        let conn_id = format!("conn-{}", self.next_conn_id.fetch_add(1, Ordering::SeqCst));
        info!("New connection from {} (conn_id: {})", addr, conn_id);

        let (write, read) = ws_stream.split();
        let write = Arc::new(Mutex::new(write));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(conn_id.clone(), read, tx));

        if let Err(e) = self.send_handshake(&write).await {
            error!("Failed to send handshake to {}: {}", conn_id, e);
            reader.abort();
            return;
        }

        let handshake = match timeout(HANDSHAKE_TIMEOUT, rx.recv()).await {
            Ok(Some(data)) => Handshake::from_json(&data).filter(Handshake::is_valid),
            Ok(None) => {
                debug!("Connection {} closed before handshake", conn_id);
                return;
            }
            Err(_) => {
                warn!("Connection {} sent no handshake within {:?}", conn_id, HANDSHAKE_TIMEOUT);
                None
            }
        };

        match handshake {
            Some(hs) => {
                if hs.should_warn_version() {
                    warn!(
                        "Connection {} speaks protocol version {}",
                        conn_id, hs.version
                    );
                }
                match (hs.role, hs.server_id) {
                    (HandshakeRole::Client, _) => {
                        debug!("{} is a client", conn_id);
                        self.run_client_session(&conn_id, &write, &mut rx).await;
                    }
                    (HandshakeRole::Peer, Some(origin)) => {
                        info!("{} is peer {}", conn_id, origin);
                        self.run_peer_session(&conn_id, &origin, &write, &mut rx).await;
                    }
                    (role, _) => {
                        warn!("Rejecting {}: unexpected role {:?}", conn_id, role);
                    }
                }
            }
            None => {
                let reply = ServerMessage::error("expected handshake");
                if let Ok(data) = reply.to_json() {
                    let _ = send_binary(&mut *write.lock().await, data).await;
                }
            }
        }

        reader.abort();
        let _ = write.lock().await.send(Message::Close(None)).await;
        debug!("Connection {} finished", conn_id);
    }

    async fn send_handshake(&self, write: &Arc<Mutex<ServerWrite>>) -> Result<(), registry_core::TransportError> {
        let data = Handshake::server(self.server_id.clone()).to_json()?;
        send_binary(&mut *write.lock().await, data).await
    }

    /// Drive one registration channel until unregister, disconnect or
    /// too many missed heartbeats.
    async fn run_client_session(
        &self,
        conn_id: &str,
        write: &Arc<Mutex<ServerWrite>>,
        rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let sink = Arc::new(WsReplySink::new(Arc::clone(write)));
        let channel = RegistrationChannel::new(
            self.coordinator.clone(),
            sink.clone(),
            self.eviction.clone(),
            self.clock.clone(),
            self.metrics.clone(),
        );
        let mut monitor = HeartbeatMonitor::new(self.heartbeat);
        let mut ticker = tokio::time::interval(monitor.interval());
        ticker.tick().await;

        loop {
            tokio::select! {
                frame = rx.recv() => match frame {
                    Some(data) => {
                        monitor.on_frame();
                        if let Err(e) = channel.handle_frame(&data).await {
                            debug!("{}: {}", conn_id, e);
                        }
                        if channel.state() == ChannelState::Closed {
                            break;
                        }
                    }
                    None => {
                        debug!("{} disconnected", conn_id);
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if monitor.on_tick() == Liveness::Dead {
                        warn!(
                            "{} missed {} heartbeats, dropping connection",
                            conn_id,
                            monitor.misses()
                        );
                        break;
                    }
                    if let Err(e) = sink.send_reply(ServerMessage::Heartbeat).await {
                        debug!("{}: heartbeat send failed: {}", conn_id, e);
                        break;
                    }
                }
            }
        }

        channel.on_connection_closed();
    }

    /// Answer replication requests from peer `origin` until it disconnects.
    async fn run_peer_session(
        &self,
        conn_id: &str,
        origin: &ServerId,
        write: &Arc<Mutex<ServerWrite>>,
        rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        while let Some(data) = rx.recv().await {
            let reply = match ReplicationMessage::decode(&data) {
                Ok(msg) => self.coordinator.apply_replicated(msg, origin).await,
                Err(e) => {
                    warn!("Undecodable replication frame from {}: {}", origin, e);
                    ReplicationReply::Error {
                        reason: format!("unexpected message: {}", e),
                    }
                }
            };

            let data = match reply.encode() {
                Ok(data) => data,
                Err(e) => {
                    error!("Failed to encode reply for {}: {}", origin, e);
                    continue;
                }
            };
            if let Err(e) = send_binary(&mut *write.lock().await, data).await {
                debug!("{}: reply to {} failed: {}", conn_id, origin, e);
                break;
            }
        }
        info!("Peer {} disconnected ({})", origin, conn_id);
    }
}
