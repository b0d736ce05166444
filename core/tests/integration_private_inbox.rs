// Integration test: store-and-forward private messages and session sync

use eter_mesh_core::channel::{ChannelError, SealedMessage};
use eter_mesh_core::crypto::CryptoError;
use eter_mesh_core::relay::protocol::inbox_prefix;
use eter_mesh_core::relay::{GraphStore, MemoryRelay, RelayEndpoint, RelayError, RelayServer};
use eter_mesh_core::{IdentityKeys, MeshConfig, MeshNode};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

fn node_on(store: &Arc<GraphStore>, keys: IdentityKeys) -> MeshNode {
    let relay: Arc<dyn RelayEndpoint> = Arc::new(MemoryRelay::new("mem://relay", store.clone()));
    MeshNode::builder(MeshConfig::default())
        .identity(keys)
        .relay_endpoints(vec![relay])
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_message_to_offline_peer_arrives_on_fetch() {
    let store = Arc::new(GraphStore::new());
    let bob_keys = IdentityKeys::generate();
    let bob_pub = bob_keys.public_key_hex();
    let bob_secret = bob_keys.to_secret_hex();

    let alice = node_on(&store, IdentityKeys::generate());
    alice.start().await.unwrap();

    // Bob is not running while the message is sent
    let sent = alice
        .channels()
        .send_private(&bob_pub, "see you at 8")
        .await
        .unwrap();
    alice.shutdown().await;

    let bob = node_on(&store, IdentityKeys::from_secret_hex(&bob_secret).unwrap());
    bob.start().await.unwrap();
    let inbox = bob.channels().fetch_inbox().await.unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].id, sent.id);
    assert_eq!(inbox[0].text, "see you at 8");
    assert_eq!(inbox[0].from, sent.from);

    bob.shutdown().await;
}

#[tokio::test]
async fn test_live_inbox_subscription() {
    let store = Arc::new(GraphStore::new());
    let alice = node_on(&store, IdentityKeys::generate());
    let bob_keys = IdentityKeys::generate();
    let bob_pub = bob_keys.public_key_hex();
    let bob = node_on(&store, bob_keys);
    alice.start().await.unwrap();
    bob.start().await.unwrap();

    let mut inbox = bob.channels().subscribe_inbox().await.unwrap();
    alice.channels().send_private(&bob_pub, "one").await.unwrap();
    alice.channels().send_private(&bob_pub, "two").await.unwrap();

    let mut texts = Vec::new();
    for _ in 0..2 {
        let msg = timeout(Duration::from_secs(2), inbox.recv()).await.unwrap().unwrap();
        texts.push(msg.text);
    }
    texts.sort();
    assert_eq!(texts, vec!["one", "two"]);

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn test_wrong_recipient_cannot_read() {
    let store = Arc::new(GraphStore::new());
    let alice = node_on(&store, IdentityKeys::generate());
    let bob_pub = IdentityKeys::generate().public_key_hex();
    let eve = node_on(&store, IdentityKeys::generate());
    alice.start().await.unwrap();
    eve.start().await.unwrap();

    alice.channels().send_private(&bob_pub, "not for eve").await.unwrap();

    // Eve reads Bob's inbox straight from the relay graph
    let raw = store.scan_prefix(&inbox_prefix(&bob_pub));
    assert_eq!(raw.len(), 1);
    let sealed: SealedMessage = serde_json::from_value(raw[0].1.clone()).unwrap();
    assert_eq!(
        eve.channels().open_private(&sealed),
        Err(ChannelError::Crypto(CryptoError::DecryptionFailed))
    );
    // Her own inbox is empty, the foreign entry never surfaces
    assert!(eve.channels().fetch_inbox().await.unwrap().is_empty());

    alice.shutdown().await;
    eve.shutdown().await;
}

#[tokio::test]
async fn test_anonymous_node_cannot_use_private_channels() {
    let store = Arc::new(GraphStore::new());
    let relay: Arc<dyn RelayEndpoint> = Arc::new(MemoryRelay::new("mem://relay", store));
    let anon = MeshNode::builder(MeshConfig::default())
        .relay_endpoints(vec![relay])
        .build()
        .unwrap();
    anon.start().await.unwrap();

    let target = IdentityKeys::generate().public_key_hex();
    assert_eq!(
        anon.channels().send_private(&target, "hi").await.unwrap_err(),
        ChannelError::IdentityRequired
    );
    assert_eq!(
        anon.channels().publish_session("s", json!({})).await.unwrap_err(),
        ChannelError::IdentityRequired
    );
    anon.shutdown().await;
}

#[tokio::test]
async fn test_session_sync_and_share_over_websocket() {
    let server = RelayServer::new().bind("127.0.0.1:0").await.unwrap();
    let config = MeshConfig::default().with_relays([server.url()]);
    let keys = IdentityKeys::generate();
    let secret = keys.to_secret_hex();

    let laptop = MeshNode::builder(config.clone()).identity(keys).build().unwrap();
    let phone = MeshNode::builder(config)
        .identity(IdentityKeys::from_secret_hex(&secret).unwrap())
        .build()
        .unwrap();
    laptop.start().await.unwrap();
    phone.start().await.unwrap();

    let mut stream = phone.channels().subscribe_session("trip").await.unwrap();
    let first = laptop
        .channels()
        .publish_session("trip", json!({"role": "user", "text": "plan a trip"}))
        .await
        .unwrap();
    let got = timeout(Duration::from_secs(2), stream.recv()).await.unwrap().unwrap();
    assert_eq!(got, first);

    let history = phone.channels().fetch_session("trip").await.unwrap();
    assert_eq!(history, vec![first]);

    let snapshot = json!({"id": "trip", "messages": history.len()});
    let share_id = laptop.channels().share_session(&snapshot).await.unwrap();
    assert_eq!(phone.channels().fetch_shared_session(&share_id).await.unwrap(), snapshot);
    assert!(matches!(
        phone.channels().fetch_shared_session("missing").await,
        Err(ChannelError::Relay(RelayError::NotFound(_)))
    ));

    laptop.shutdown().await;
    phone.shutdown().await;
    server.shutdown().await;
}
