// Integration test: relay bridge against real WebSocket relay servers

use eter_mesh_core::relay::protocol::pulse_key;
use eter_mesh_core::relay::{RelayBridge, RelayError, RelayServer};
use eter_mesh_core::{MeshConfig, MeshNode, NetworkStatus, PeerId};
use serde_json::json;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};

fn config_for(relays: &[String]) -> MeshConfig {
    MeshConfig {
        staleness_window_ms: 2_000,
        heartbeat_interval_ms: 100,
        self_test_timeout_ms: 1_000,
        connect_timeout_ms: 500,
        request_timeout_ms: 1_000,
        reconnect_base_ms: 50,
        reconnect_max_ms: 400,
        stun_servers: Vec::new(),
        ..MeshConfig::default()
    }
    .with_relays(relays.iter().cloned())
}

/// A port nothing listens on
async fn dead_relay_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{}", addr)
}

async fn wait_until(limit: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(25)).await;
    }
    check()
}

#[tokio::test]
async fn test_put_get_list_over_websocket() {
    let server = RelayServer::new().bind("127.0.0.1:0").await.unwrap();
    let bridge = RelayBridge::from_config(PeerId::new("writer"), &config_for(&[server.url()]));

    assert_eq!(bridge.connect().await.unwrap(), 1);
    assert_eq!(bridge.put("notes/a", json!({"n": 1})).await.unwrap(), 1);
    bridge.put("notes/b", json!({"n": 2})).await.unwrap();

    assert_eq!(bridge.get("notes/a").await.unwrap(), Some(json!({"n": 1})));
    assert_eq!(bridge.get("notes/missing").await.unwrap(), None);
    let listed = bridge.list("notes/").await.unwrap();
    assert_eq!(listed.len(), 2);
    assert!(server.stats().writes_applied >= 2);

    bridge.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_subscription_replays_then_streams() {
    let server = RelayServer::new().bind("127.0.0.1:0").await.unwrap();
    let config = config_for(&[server.url()]);
    let writer = RelayBridge::from_config(PeerId::new("writer"), &config);
    let reader = RelayBridge::from_config(PeerId::new("reader"), &config);
    writer.connect().await.unwrap();
    reader.connect().await.unwrap();

    writer.publish("room", "1", json!("before")).await.unwrap();
    let mut feed = reader.subscribe("room").await;
    let (_, first) = timeout(Duration::from_secs(2), feed.recv()).await.unwrap().unwrap();
    assert_eq!(first, json!("before"));

    writer.publish("room", "2", json!("after")).await.unwrap();
    let (key, second) = timeout(Duration::from_secs(2), feed.recv()).await.unwrap().unwrap();
    assert_eq!(key, "room/2");
    assert_eq!(second, json!("after"));

    writer.shutdown().await;
    reader.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_first_reachable_relay_wins() {
    let server = RelayServer::new().bind("127.0.0.1:0").await.unwrap();
    let relays = vec![dead_relay_url().await, server.url()];
    let bridge = RelayBridge::from_config(PeerId::new("p"), &config_for(&relays));

    let connected = bridge.connect().await.unwrap();
    assert_eq!(connected, 1);
    assert_eq!(bridge.health().configured, 2);
    assert!(bridge.self_test().await);

    bridge.emit_presence(&PeerId::new("p")).await.unwrap();
    let mut pulses = bridge.subscribe_presence().await;
    let (peer, pulse) = timeout(Duration::from_secs(2), pulses.recv()).await.unwrap().unwrap();
    assert_eq!(peer, PeerId::new("p"));
    assert_eq!(pulse.status, "online");

    bridge.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_all_relays_unreachable() {
    let relays = vec![dead_relay_url().await, dead_relay_url().await];
    let bridge = RelayBridge::from_config(PeerId::new("p"), &config_for(&relays));
    assert_eq!(bridge.connect().await, Err(RelayError::NoRelayReachable));
    assert!(!bridge.health().is_online());
    bridge.shutdown().await;
}

#[tokio::test]
async fn test_share_snapshot_over_websocket() {
    let server = RelayServer::new().bind("127.0.0.1:0").await.unwrap();
    let config = config_for(&[server.url()]);
    let author = RelayBridge::from_config(PeerId::new("author"), &config);
    let reader = RelayBridge::from_config(PeerId::new("reader"), &config);
    author.connect().await.unwrap();
    reader.connect().await.unwrap();

    let session = json!({"title": "road trip", "messages": ["a", "b"]});
    let share_id = author.share_snapshot(&session).await.unwrap();
    assert_eq!(share_id.len(), 13);
    assert_eq!(reader.fetch_snapshot(&share_id).await.unwrap(), session);
    assert!(matches!(
        reader.fetch_snapshot("nonexistent00").await,
        Err(RelayError::NotFound(_))
    ));

    author.shutdown().await;
    reader.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_nodes_meet_through_relay_server() {
    let server = RelayServer::new().bind("127.0.0.1:0").await.unwrap();
    let config = config_for(&[server.url()]);
    let alice = MeshNode::builder(config.clone()).build().unwrap();
    let bob = MeshNode::builder(config).build().unwrap();
    alice.start().await.unwrap();
    bob.start().await.unwrap();

    assert!(wait_until(Duration::from_secs(5), || alice.peer_count() == 1 && bob.peer_count() == 1).await);
    assert!(wait_until(Duration::from_secs(3), || alice.status() == NetworkStatus::Online).await);

    alice.shutdown().await;
    bob.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_bridge_reconnects_after_relay_restart() {
    let server = RelayServer::new().bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr();
    let bridge = RelayBridge::from_config(PeerId::new("p"), &config_for(&[server.url()]));
    bridge.connect().await.unwrap();
    let mut feed = bridge.subscribe_prefix(&pulse_key("")).await;

    server.shutdown().await;
    assert!(wait_until(Duration::from_secs(3), || bridge.connected_count() == 0).await);

    let restarted = RelayServer::new().bind(&addr.to_string()).await.unwrap();
    assert!(wait_until(Duration::from_secs(5), || bridge.connected_count() == 1).await);

    // Subscriptions are re-attached on reconnect
    bridge.emit_presence(&PeerId::new("p")).await.unwrap();
    let (key, _) = timeout(Duration::from_secs(2), feed.recv()).await.unwrap().unwrap();
    assert_eq!(key, pulse_key("p"));

    bridge.shutdown().await;
    restarted.shutdown().await;
}
