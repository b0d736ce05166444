// Integration test: direct links negotiated through the WebSocket
// rendezvous server

use eter_mesh_core::identity::PeerId;
use eter_mesh_core::relay::RelayServer;
use eter_mesh_core::signaling::{
    SignalEnvelope, SignalingChannel, SignalingEvent, SignalingFrame, SignalingServer, WsSignalingClient,
};
use eter_mesh_core::transport::{LinkOptions, LoopbackNetwork, TransportEvent, TransportManager, TransportState};
use eter_mesh_core::{MeshConfig, MeshNode};
use futures::SinkExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::Message;

fn manager(id: &str, network: &LoopbackNetwork) -> TransportManager {
    TransportManager::new(
        PeerId::new(id),
        Arc::new(network.clone()),
        LinkOptions::with_stun(Vec::new()),
    )
}

async fn next_event(rx: &mut broadcast::Receiver<TransportEvent>) -> TransportEvent {
    timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("timed out waiting for transport event")
        .expect("transport event channel closed")
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
async fn test_peers_connect_through_rendezvous() {
    let server = SignalingServer::new().bind("127.0.0.1:0").await.unwrap();
    let network = LoopbackNetwork::new();
    let alice = manager("alice", &network);
    let bob = manager("bob", &network);
    let mut alice_events = alice.subscribe();
    let mut bob_events = bob.subscribe();

    alice
        .attach_signaling(Arc::new(WsSignalingClient::new(server.url())))
        .await
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || server.peer_count() == 1).await);
    bob.attach_signaling(Arc::new(WsSignalingClient::new(server.url())))
        .await
        .unwrap();

    assert_eq!(
        next_event(&mut alice_events).await,
        TransportEvent::Connected { peer_id: "bob".into() }
    );
    assert_eq!(
        next_event(&mut bob_events).await,
        TransportEvent::Connected { peer_id: "alice".into() }
    );

    bob.send(&"alice".into(), b"ping".to_vec()).unwrap();
    assert_eq!(
        next_event(&mut alice_events).await,
        TransportEvent::DataReceived {
            peer_id: "bob".into(),
            data: b"ping".to_vec()
        }
    );

    alice.shutdown().await;
    bob.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_departure_tears_down_link() {
    let server = SignalingServer::new().bind("127.0.0.1:0").await.unwrap();
    let network = LoopbackNetwork::new();
    let alice = manager("alice", &network);
    let bob = manager("bob", &network);

    alice
        .attach_signaling(Arc::new(WsSignalingClient::new(server.url())))
        .await
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || server.peer_count() == 1).await);
    bob.attach_signaling(Arc::new(WsSignalingClient::new(server.url())))
        .await
        .unwrap();
    assert!(wait_until(Duration::from_secs(3), || alice.connection_count() == 1).await);

    let mut alice_events = alice.subscribe();
    bob.shutdown().await;
    assert_eq!(
        next_event(&mut alice_events).await,
        TransportEvent::Disconnected { peer_id: "bob".into() }
    );
    assert_eq!(alice.state(&"bob".into()), TransportState::Idle);
    assert!(wait_until(Duration::from_secs(2), || server.peer_count() == 1).await);

    alice.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_server_ignores_garbage_and_forwards_with_true_sender() {
    let server = SignalingServer::new().bind("127.0.0.1:0").await.unwrap();

    let receiver = WsSignalingClient::new(server.url());
    let mut events = receiver.register(&PeerId::new("target")).await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || server.peer_count() == 1).await);

    let (mut raw, _) = tokio_tungstenite::connect_async(server.url()).await.unwrap();
    raw.send(Message::Text("{{ not json".into())).await.unwrap();
    raw.send(Message::Text(
        SignalingFrame::Register { peer_id: "liar".into() }.to_text().unwrap(),
    ))
    .await
    .unwrap();

    // Claims to come from someone else; the server stamps the real sender
    let forged = SignalEnvelope::offer("mallory".into(), "target".into(), "v=0");
    raw.send(Message::Text(
        SignalingFrame::Signal { signal: forged }.to_text().unwrap(),
    ))
    .await
    .unwrap();

    let mut saw_offer = false;
    while let Ok(Some(event)) = timeout(Duration::from_secs(2), events.recv()).await {
        match event {
            SignalingEvent::PeerJoined(peer) => assert_eq!(peer, PeerId::new("liar")),
            SignalingEvent::Signal(signal) => {
                assert_eq!(signal.from_peer(), &PeerId::new("liar"));
                saw_offer = true;
                break;
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert!(saw_offer);

    raw.close(None).await.unwrap();
    let left = timeout(Duration::from_secs(2), events.recv()).await.unwrap();
    assert_eq!(left, Some(SignalingEvent::PeerLeft("liar".into())));

    receiver.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_register_against_dead_server_fails() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);

    let client = WsSignalingClient::new(url);
    assert!(client.register(&PeerId::new("x")).await.is_err());
}

#[tokio::test]
async fn test_full_stack_nodes() {
    let relay = RelayServer::new().bind("127.0.0.1:0").await.unwrap();
    let signaling = SignalingServer::new().bind("127.0.0.1:0").await.unwrap();
    let network = LoopbackNetwork::new();
    let config = MeshConfig {
        staleness_window_ms: 2_000,
        heartbeat_interval_ms: 100,
        stun_servers: Vec::new(),
        ..MeshConfig::default()
    }
    .with_relays([relay.url()])
    .with_signaling(signaling.url());

    let build = |alias: &str| {
        MeshNode::builder(config.clone())
            .alias(alias)
            .link_factory(Arc::new(network.clone()))
            .build()
            .unwrap()
    };
    let alice = build("alice");
    let bob = build("bob");
    alice.start().await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || signaling.peer_count() == 1).await);
    bob.start().await.unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        alice.transport().connection_count() == 1 && bob.transport().connection_count() == 1
    })
    .await);
    assert!(wait_until(Duration::from_secs(5), || alice.peer_count() == 1 && bob.peer_count() == 1).await);

    let mut channel = bob.channels().join_public("lobby").await.unwrap();
    let sent = alice.channels().send_public("lobby", "hi bob").await.unwrap();
    assert_eq!(sent.direct, 1);
    let got = timeout(Duration::from_secs(2), channel.recv()).await.unwrap().unwrap();
    assert_eq!(got.text, "hi bob");
    assert!(timeout(Duration::from_millis(300), channel.recv()).await.is_err());

    alice.shutdown().await;
    bob.shutdown().await;
    signaling.shutdown().await;
    relay.shutdown().await;
}

#[tokio::test]
async fn test_nodes_reregister_after_signaling_restart() -> anyhow::Result<()> {
    let signaling = SignalingServer::new().bind("127.0.0.1:0").await?;
    let addr = signaling.local_addr().to_string();
    let network = LoopbackNetwork::new();
    let config = MeshConfig {
        reconnect_base_ms: 50,
        reconnect_max_ms: 200,
        stun_servers: Vec::new(),
        ..MeshConfig::default()
    }
    .with_signaling(signaling.url());
    let build = |alias: &str| {
        MeshNode::builder(config.clone())
            .alias(alias)
            .link_factory(Arc::new(network.clone()))
            .build()
    };

    let alice = build("alice")?;
    alice.start().await?;
    anyhow::ensure!(
        wait_until(Duration::from_secs(2), || signaling.peer_count() == 1).await,
        "alice never registered"
    );

    signaling.shutdown().await;
    let signaling = SignalingServer::new().bind(&addr).await?;
    anyhow::ensure!(
        wait_until(Duration::from_secs(3), || signaling.peer_count() == 1).await,
        "alice did not re-register with the restarted server"
    );

    let bob = build("bob")?;
    bob.start().await?;
    anyhow::ensure!(
        wait_until(Duration::from_secs(5), || {
            alice.transport().connection_count() == 1 && bob.transport().connection_count() == 1
        })
        .await,
        "no direct link through the restarted server"
    );
    assert_eq!(signaling.peer_count(), 2);

    alice.shutdown().await;
    bob.shutdown().await;
    signaling.shutdown().await;
    Ok(())
}
