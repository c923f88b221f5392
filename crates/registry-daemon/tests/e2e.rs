//! End-to-end tests for registry-daemon.
//!
//! Tests the full server behavior: WebSocket connections, handshakes,
//! registration channels and replication between running nodes.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use registry_core::protocol::{Handshake, HandshakeRole};
use registry_core::{
    ClientMessage, InstanceId, InstanceRecord, ServerMessage, Source, SystemClock,
};
use registry_daemon::{NodeHandle, RegistryNode, ServerConfig};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

/// Test client that registers an instance with a node.
struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    /// Connect to the node and complete handshake.
    async fn connect_and_handshake(url: &str) -> Self {
        let (ws, _) = connect_async(url).await.expect("Failed to connect");
        let mut client = Self { ws };

        // Receive server handshake
        let server_hs = client.expect_handshake().await;
        assert_eq!(server_hs.role, HandshakeRole::Server, "Server should send server role");
        assert!(server_hs.server_id.is_some());

        // Send our handshake
        let our_hs = Handshake::client().to_json().unwrap();
        client.send_binary(&our_hs).await;

        client
    }

    /// Receive and parse handshake message.
    async fn expect_handshake(&mut self) -> Handshake {
        let msg = self.recv_message().await;
        Handshake::from_json(&msg).expect("Expected handshake message")
    }

    /// Receive binary or text message.
    async fn recv_message(&mut self) -> Vec<u8> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Binary(data))) => return data.to_vec(),
                Some(Ok(Message::Text(text))) => return text.into_bytes(),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => panic!("Connection closed unexpectedly"),
                Some(Err(e)) => panic!("WebSocket error: {}", e),
                None => panic!("Stream ended unexpectedly"),
                _ => continue,
            }
        }
    }

    /// Receive the next reply that is not a server heartbeat.
    async fn expect_reply(&mut self) -> ServerMessage {
        loop {
            let data = timeout(Duration::from_secs(5), self.recv_message())
                .await
                .expect("Timeout waiting for reply");
            match ServerMessage::from_json(&data).expect("Expected server message") {
                ServerMessage::Heartbeat => continue,
                reply => return reply,
            }
        }
    }

    async fn send(&mut self, msg: &ClientMessage) {
        self.send_binary(&msg.to_json().unwrap()).await;
    }

    /// Send binary message.
    async fn send_binary(&mut self, data: &[u8]) {
        self.ws
            .send(Message::Binary(data.to_vec()))
            .await
            .expect("Failed to send message");
    }

    /// Close connection gracefully.
    async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn record(id: &str, version: u64) -> InstanceRecord {
    InstanceRecord::builder(id, "web").version(version).build()
}

/// Start a node on a random port.
async fn start_node(peers: Vec<String>) -> (RegistryNode, NodeHandle) {
    let config = ServerConfig {
        peers,
        peer_timeout: Duration::from_secs(2),
        ..ServerConfig::default()
    };
    let node = RegistryNode::new(config, Arc::new(SystemClock));
    let handle = node.start().await.expect("Failed to start node");
    (node, handle)
}

/// Poll `check` until it holds or the timeout passes.
async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

// ============================================================================
// Registration Channel Tests
// ============================================================================

#[tokio::test]
async fn test_register_acknowledged() {
    let (node, handle) = start_node(Vec::new()).await;
    let mut client = TestClient::connect_and_handshake(&handle.url()).await;

    client
        .send(&ClientMessage::Register {
            instance: record("web-1", 0),
        })
        .await;
    assert_eq!(client.expect_reply().await, ServerMessage::Ack);

    let id = InstanceId::from("web-1");
    let stored = node.coordinator().store().get(&id).unwrap();
    assert_eq!(stored.version(), 1);
    assert_eq!(
        node.coordinator().store().lease(&id).unwrap().source(),
        &Source::Local
    );

    client.close().await;
}

#[tokio::test]
async fn test_second_register_rejected() {
    let (_node, handle) = start_node(Vec::new()).await;
    let mut client = TestClient::connect_and_handshake(&handle.url()).await;

    client
        .send(&ClientMessage::Register {
            instance: record("web-1", 0),
        })
        .await;
    assert_eq!(client.expect_reply().await, ServerMessage::Ack);

    client
        .send(&ClientMessage::Register {
            instance: record("web-1", 0),
        })
        .await;
    match client.expect_reply().await {
        ServerMessage::Error { reason } => assert!(reason.contains("registered")),
        other => panic!("Expected error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_update_bumps_version() {
    let (node, handle) = start_node(Vec::new()).await;
    let mut client = TestClient::connect_and_handshake(&handle.url()).await;

    client
        .send(&ClientMessage::Register {
            instance: record("web-1", 0),
        })
        .await;
    assert_eq!(client.expect_reply().await, ServerMessage::Ack);

    let changed = InstanceRecord::builder("web-1", "web")
        .vip_address("web.internal")
        .build();
    client.send(&ClientMessage::Update { instance: changed }).await;
    assert_eq!(client.expect_reply().await, ServerMessage::Ack);

    let stored = node
        .coordinator()
        .store()
        .get(&InstanceId::from("web-1"))
        .unwrap();
    assert_eq!(stored.version(), 2);
    assert_eq!(stored.vip_address(), Some("web.internal"));
}

#[tokio::test]
async fn test_unparseable_frame_rejected() {
    let (_node, handle) = start_node(Vec::new()).await;
    let mut client = TestClient::connect_and_handshake(&handle.url()).await;

    client.send_binary(b"not json").await;
    match client.expect_reply().await {
        ServerMessage::Error { reason } => assert!(reason.contains("unexpected message")),
        other => panic!("Expected error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unregister_removes_instance() {
    let (node, handle) = start_node(Vec::new()).await;
    let mut client = TestClient::connect_and_handshake(&handle.url()).await;

    client
        .send(&ClientMessage::Register {
            instance: record("web-1", 0),
        })
        .await;
    assert_eq!(client.expect_reply().await, ServerMessage::Ack);

    client.send(&ClientMessage::Unregister).await;
    assert_eq!(client.expect_reply().await, ServerMessage::Ack);
    assert!(node.coordinator().store().is_empty());
    assert!(node.eviction_queue().is_empty());
}

#[tokio::test]
async fn test_disconnect_queues_eviction() {
    let (node, handle) = start_node(Vec::new()).await;
    let mut client = TestClient::connect_and_handshake(&handle.url()).await;

    client
        .send(&ClientMessage::Register {
            instance: record("web-1", 0),
        })
        .await;
    assert_eq!(client.expect_reply().await, ServerMessage::Ack);
    client.close().await;

    let id = InstanceId::from("web-1");
    let queue = Arc::clone(node.eviction_queue());
    assert!(wait_for(|| queue.contains(&id)).await);
    // The lease stays until the scheduler gets to it
    assert!(node.coordinator().store().get(&id).is_some());
}

#[tokio::test]
async fn test_missing_handshake_rejected() {
    let (_node, handle) = start_node(Vec::new()).await;
    let (ws, _) = connect_async(handle.url()).await.expect("Failed to connect");
    let mut client = TestClient { ws };
    client.expect_handshake().await;

    client
        .send(&ClientMessage::Register {
            instance: record("web-1", 0),
        })
        .await;
    match client.expect_reply().await {
        ServerMessage::Error { reason } => assert!(reason.contains("handshake")),
        other => panic!("Expected error, got {:?}", other),
    }
}

// ============================================================================
// Replication Tests
// ============================================================================

#[tokio::test]
async fn test_sync_up_copies_peer_registry() {
    let (node_a, handle_a) = start_node(Vec::new()).await;
    let mut client = TestClient::connect_and_handshake(&handle_a.url()).await;
    client
        .send(&ClientMessage::Register {
            instance: record("web-1", 0),
        })
        .await;
    assert_eq!(client.expect_reply().await, ServerMessage::Ack);

    let (node_b, _handle_b) = start_node(vec![handle_a.url()]).await;
    assert_eq!(node_b.sync_up().await, 1);

    let id = InstanceId::from("web-1");
    let lease = node_b.coordinator().store().lease(&id).unwrap();
    assert_eq!(lease.version(), 1);
    assert_eq!(
        lease.source(),
        &Source::Replicated(node_a.config().server_id.clone())
    );
    assert!(node_b.coordinator().should_allow_access(false));
}

#[tokio::test]
async fn test_sync_up_ignores_empty_starting_peer() {
    let (_node_a, handle_a) = start_node(Vec::new()).await;
    let (node_b, _handle_b) = start_node(vec![handle_a.url()]).await;

    // A has nothing yet, so it refuses to hand out an empty registry
    assert_eq!(node_b.sync_up().await, 0);
    assert!(!node_b.coordinator().should_allow_access(false));
}

#[tokio::test]
async fn test_sync_up_with_unreachable_peer() {
    let (node, _handle) = start_node(vec!["ws://127.0.0.1:1".to_string()]).await;
    assert_eq!(node.sync_up().await, 0);
    assert!(!node.coordinator().should_allow_access(false));
}

#[tokio::test]
async fn test_client_register_replicated_to_peer() {
    let (node_b, handle_b) = start_node(Vec::new()).await;
    let (node_a, handle_a) = start_node(vec![handle_b.url()]).await;

    let mut client = TestClient::connect_and_handshake(&handle_a.url()).await;
    client
        .send(&ClientMessage::Register {
            instance: record("web-1", 0),
        })
        .await;
    assert_eq!(client.expect_reply().await, ServerMessage::Ack);

    let id = InstanceId::from("web-1");
    let store_b = Arc::clone(node_b.coordinator().store());
    assert!(wait_for(|| store_b.get(&id).is_some()).await);
    assert_eq!(
        store_b.lease(&id).unwrap().source(),
        &Source::Replicated(node_a.config().server_id.clone())
    );

    client.send(&ClientMessage::Unregister).await;
    assert_eq!(client.expect_reply().await, ServerMessage::Ack);
    assert!(wait_for(|| store_b.get(&id).is_none()).await);
}

#[tokio::test]
async fn test_self_registration_visible_to_peer() {
    let (node_b, handle_b) = start_node(Vec::new()).await;
    let (node_a, mut handle_a) = start_node(vec![handle_b.url()]).await;

    let own = node_a.self_register(&mut handle_a).await.unwrap();
    assert!(own.id().as_str().starts_with("registry#"));

    let store_b = Arc::clone(node_b.coordinator().store());
    assert!(wait_for(|| store_b.get(own.id()).is_some()).await);
    // The registry's own instance does not count towards serving reads
    assert!(!node_a.coordinator().should_allow_access(false));
}
