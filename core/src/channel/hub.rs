//! Channel hub: public, private and session channels over both transports

use super::timeline::Timeline;
use super::types::{
    validate_channel_name, ChannelError, ChannelFrame, PrivateBody, PrivateMessage, PublicMessage, SealedMessage,
    SessionMessage,
};
use crate::config::DeliveryPolicy;
use crate::crypto::{self, SealedEnvelope, SessionKey};
use crate::identity::{IdentityKeys, PeerId};
use crate::relay::protocol::{channel_prefix, inbox_prefix, public_channel, session_prefix};
use crate::relay::{GraphFeed, RelayBridge};
use crate::transport::{TransportEvent, TransportManager};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Where a public message went
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub message: PublicMessage,
    /// Direct peers that accepted the frame
    pub direct: usize,
    /// Relays that acknowledged the write
    pub relay: usize,
}

/// Entry point for every message channel of one node
#[derive(Clone)]
pub struct ChannelHub {
    bridge: RelayBridge,
    transport: TransportManager,
    identity: Option<Arc<IdentityKeys>>,
    local: PeerId,
    alias: String,
    policy: DeliveryPolicy,
    last_session_ts: Arc<AtomicU64>,
}

impl ChannelHub {
    pub fn new(
        bridge: RelayBridge,
        transport: TransportManager,
        identity: Option<Arc<IdentityKeys>>,
        alias: impl Into<String>,
        policy: DeliveryPolicy,
    ) -> Self {
        let local = bridge.local_peer().clone();
        Self {
            bridge,
            transport,
            identity,
            local,
            alias: alias.into(),
            policy,
            last_session_ts: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn policy(&self) -> DeliveryPolicy {
        self.policy
    }

    fn identity(&self) -> Result<&IdentityKeys, ChannelError> {
        self.identity
            .as_deref()
            .ok_or(ChannelError::IdentityRequired)
    }

    // ----- public -----

    /// Send `text` on the public channel `channel`, following the delivery
    /// policy. Succeeds if at least one path took the message.
    pub async fn send_public(&self, channel: &str, text: &str) -> Result<DeliveryReport, ChannelError> {
        validate_channel_name(channel)?;
        let message = PublicMessage::new(text, self.local.as_str(), self.alias.clone());
        message.validate()?;

        let direct = if self.policy.uses_direct() {
            let frame = ChannelFrame::direct(channel, message.clone()).to_bytes()?;
            self.transport.broadcast(&frame)
        } else {
            0
        };

        let mut relay_error = None;
        let relay = if self.policy.needs_relay(direct) {
            let value = serde_json::to_value(&message)
                .map_err(|e| ChannelError::Serialization(e.to_string()))?;
            match self
                .bridge
                .publish(&public_channel(channel), &message.id, value)
                .await
            {
                Ok(acks) => acks,
                Err(e) => {
                    warn!("Relay publish on {} failed: {}", channel, e);
                    relay_error = Some(e);
                    0
                }
            }
        } else {
            0
        };

        if direct == 0 && relay == 0 {
            let reason = match relay_error {
                Some(e) => e.to_string(),
                None => "no direct peers and no relay acknowledged".to_string(),
            };
            return Err(ChannelError::Undelivered(reason));
        }
        debug!(
            "Public message {} on {}: {} direct, {} relay",
            message.id, channel, direct, relay
        );
        Ok(DeliveryReport {
            message,
            direct,
            relay,
        })
    }

    /// Join a public channel: merged relay + direct feed, one copy per id
    pub async fn join_public(&self, channel: &str) -> Result<PublicChannel, ChannelError> {
        validate_channel_name(channel)?;
        let relay_feed = self.bridge.subscribe(&public_channel(channel)).await;
        let direct_feed = self.transport.subscribe();
        let timeline = Arc::new(Mutex::new(Timeline::new()));
        let (tx, rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(merge_public(
            channel.to_string(),
            relay_feed,
            direct_feed,
            timeline.clone(),
            tx,
        ));
        info!("Joined public channel {}", channel);
        Ok(PublicChannel {
            name: channel.to_string(),
            timeline,
            rx,
            task,
        })
    }

    // ----- private inbox -----

    /// Encrypt `text` for `recipient_pub` (hex Ed25519 key) and append it to
    /// their inbox. Works while the recipient is offline.
    pub async fn send_private(&self, recipient_pub: &str, text: &str) -> Result<PrivateMessage, ChannelError> {
        let identity = self.identity()?;
        let recipient = crypto::parse_public_key_hex(recipient_pub)?;
        let body = PrivateBody {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.to_string(),
            timestamp: crate::now_millis(),
        };
        let plaintext =
            serde_json::to_vec(&body).map_err(|e| ChannelError::Serialization(e.to_string()))?;
        let envelope = crypto::seal(&identity.signing_key, &recipient, &plaintext)?;
        let sealed = SealedMessage {
            ciphertext: envelope.to_wire()?,
            sender_pub: identity.public_key_hex(),
            timestamp: body.timestamp,
        };
        let value =
            serde_json::to_value(&sealed).map_err(|e| ChannelError::Serialization(e.to_string()))?;
        let key = format!("{}{}", inbox_prefix(recipient_pub), body.id);
        self.bridge.put(&key, value).await?;
        info!("Private message {} queued for {}", body.id, &recipient_pub[..12.min(recipient_pub.len())]);

        Ok(PrivateMessage {
            id: body.id,
            from: sealed.sender_pub,
            text: body.text,
            timestamp: body.timestamp,
        })
    }

    /// Decrypt one inbox entry addressed to us
    pub fn open_private(&self, sealed: &SealedMessage) -> Result<PrivateMessage, ChannelError> {
        let identity = self.identity()?;
        let envelope = SealedEnvelope::from_wire(&sealed.ciphertext)?;
        if envelope.sender_public_key_hex() != sealed.sender_pub.to_lowercase() {
            return Err(ChannelError::Crypto(crypto::CryptoError::MalformedCiphertext(
                "sender key mismatch".into(),
            )));
        }
        let plaintext = crypto::open(&identity.signing_key, &envelope)?;
        let body: PrivateBody = serde_json::from_slice(&plaintext)
            .map_err(|e| ChannelError::InvalidMessage(e.to_string()))?;
        Ok(PrivateMessage {
            id: body.id,
            from: envelope.sender_public_key_hex(),
            text: body.text,
            timestamp: body.timestamp,
        })
    }

    /// Everything currently in our inbox, oldest first. Entries that do not
    /// decrypt are dropped.
    pub async fn fetch_inbox(&self) -> Result<Vec<PrivateMessage>, ChannelError> {
        let identity = self.identity()?;
        let entries = self
            .bridge
            .list(&inbox_prefix(&identity.public_key_hex()))
            .await?;
        let mut messages: Vec<PrivateMessage> = entries
            .into_iter()
            .filter_map(|(key, value)| match self.open_inbox_value(value) {
                Ok(message) => Some(message),
                Err(e) => {
                    debug!("Dropping inbox entry {}: {}", key, e);
                    None
                }
            })
            .collect();
        messages.sort_by_key(|m| m.timestamp);
        Ok(messages)
    }

    /// Live inbox: existing entries, then new ones as they arrive
    pub async fn subscribe_inbox(&self) -> Result<mpsc::UnboundedReceiver<PrivateMessage>, ChannelError> {
        let identity = self.identity()?;
        let mut feed = self
            .bridge
            .subscribe_prefix(&inbox_prefix(&identity.public_key_hex()))
            .await;
        let hub = self.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut seen = HashSet::new();
            while let Some((key, value)) = feed.recv().await {
                if !seen.insert(key.clone()) {
                    continue;
                }
                match hub.open_inbox_value(value) {
                    Ok(message) => {
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!("Dropping inbox entry {}: {}", key, e),
                }
            }
        });
        Ok(rx)
    }

    fn open_inbox_value(&self, value: Value) -> Result<PrivateMessage, ChannelError> {
        let sealed: SealedMessage = serde_json::from_value(value)
            .map_err(|e| ChannelError::InvalidMessage(e.to_string()))?;
        self.open_private(&sealed)
    }

    // ----- session sync -----

    fn next_session_timestamp(&self) -> u64 {
        let now = crate::now_millis();
        let mut last = self.last_session_ts.load(Ordering::SeqCst);
        loop {
            let next = now.max(last + 1);
            match self
                .last_session_ts
                .compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }

    /// Encrypt `body` with the session key and store it under the session
    pub async fn publish_session(&self, session_id: &str, body: Value) -> Result<SessionMessage, ChannelError> {
        let identity = self.identity()?;
        let key = SessionKey::derive(identity, session_id);
        let message = SessionMessage {
            id: uuid::Uuid::new_v4().to_string(),
            body,
            timestamp: self.next_session_timestamp(),
        };
        let plaintext =
            serde_json::to_vec(&message).map_err(|e| ChannelError::Serialization(e.to_string()))?;
        let sealed = SealedMessage {
            ciphertext: crypto::encrypt_session(&key, &plaintext)?,
            sender_pub: identity.public_key_hex(),
            timestamp: message.timestamp,
        };
        let value =
            serde_json::to_value(&sealed).map_err(|e| ChannelError::Serialization(e.to_string()))?;
        let path = format!(
            "{}{}",
            session_prefix(&identity.public_key_hex(), session_id),
            message.timestamp
        );
        self.bridge.put(&path, value).await?;
        Ok(message)
    }

    /// Stored session entries, oldest first
    pub async fn fetch_session(&self, session_id: &str) -> Result<Vec<SessionMessage>, ChannelError> {
        let identity = self.identity()?;
        let key = SessionKey::derive(identity, session_id);
        let entries = self
            .bridge
            .list(&session_prefix(&identity.public_key_hex(), session_id))
            .await?;
        let mut messages: Vec<SessionMessage> = entries
            .into_iter()
            .filter_map(|(_, value)| open_session_value(&key, value).ok())
            .collect();
        messages.sort_by_key(|m| m.timestamp);
        Ok(messages)
    }

    /// Live session stream. Entries that fail to decrypt are skipped.
    pub async fn subscribe_session(
        &self,
        session_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<SessionMessage>, ChannelError> {
        let identity = self.identity()?;
        let key = SessionKey::derive(identity, session_id);
        let mut feed = self
            .bridge
            .subscribe_prefix(&session_prefix(&identity.public_key_hex(), session_id))
            .await;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut seen = HashSet::new();
            while let Some((path, value)) = feed.recv().await {
                if !seen.insert(path) {
                    continue;
                }
                if let Ok(message) = open_session_value(&key, value) {
                    if tx.send(message).is_err() {
                        break;
                    }
                }
            }
        });
        Ok(rx)
    }

    /// Publish a whole session snapshot for out-of-band sharing
    pub async fn share_session(&self, session: &Value) -> Result<String, ChannelError> {
        Ok(self.bridge.share_snapshot(session).await?)
    }

    pub async fn fetch_shared_session(&self, share_id: &str) -> Result<Value, ChannelError> {
        Ok(self.bridge.fetch_snapshot(share_id).await?)
    }
}

fn open_session_value(key: &SessionKey, value: Value) -> Result<SessionMessage, ChannelError> {
    let sealed: SealedMessage =
        serde_json::from_value(value).map_err(|e| ChannelError::InvalidMessage(e.to_string()))?;
    let plaintext = crypto::decrypt_session(key, &sealed.ciphertext)?;
    serde_json::from_slice(&plaintext).map_err(|e| ChannelError::InvalidMessage(e.to_string()))
}

async fn merge_public(
    channel: String,
    mut relay_feed: GraphFeed,
    mut direct_feed: broadcast::Receiver<TransportEvent>,
    timeline: Arc<Mutex<Timeline>>,
    tx: mpsc::UnboundedSender<PublicMessage>,
) {
    let prefix = channel_prefix(&public_channel(&channel));
    let mut relay_open = true;
    let mut direct_open = true;
    while relay_open || direct_open {
        let message = tokio::select! {
            item = relay_feed.recv(), if relay_open => match item {
                Some((key, _)) if !is_direct_child(&key, &prefix) => continue,
                Some((key, value)) => match serde_json::from_value::<PublicMessage>(value) {
                    Ok(message) if message.validate().is_ok() => message,
                    _ => {
                        debug!("Dropping malformed relay message {}", key);
                        continue;
                    }
                },
                None => {
                    relay_open = false;
                    continue;
                }
            },
            event = direct_feed.recv(), if direct_open => match event {
                Ok(TransportEvent::DataReceived { peer_id, data }) => {
                    match ChannelFrame::from_bytes(&data) {
                        Ok(frame) if frame.channel == channel => frame.message,
                        Ok(_) => continue,
                        Err(e) => {
                            debug!("Dropping direct frame from {}: {}", peer_id.short(), e);
                            continue;
                        }
                    }
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Public channel {} missed {} direct events", channel, n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    direct_open = false;
                    continue;
                }
            },
        };

        let fresh = timeline.lock().insert(message.clone());
        if fresh && tx.send(message).is_err() {
            break;
        }
    }
}

/// `key` sits exactly one segment below `prefix`
fn is_direct_child(key: &str, prefix: &str) -> bool {
    key.strip_prefix(prefix)
        .map_or(false, |leaf| !leaf.is_empty() && !leaf.contains('/'))
}

/// A joined public channel
pub struct PublicChannel {
    name: String,
    timeline: Arc<Mutex<Timeline>>,
    rx: mpsc::UnboundedReceiver<PublicMessage>,
    task: JoinHandle<()>,
}

impl PublicChannel {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next message not seen before, in arrival order
    pub async fn recv(&mut self) -> Option<PublicMessage> {
        self.rx.recv().await
    }

    /// Sorted snapshot of the timeline
    pub fn messages(&self) -> Vec<PublicMessage> {
        self.timeline.lock().messages()
    }

    /// Drop the local timeline and everything it remembers. The channel
    /// stays joined; a rejoin replays relay history from scratch.
    pub fn purge(&self) {
        self.timeline.lock().clear();
        debug!("Purged timeline of {}", self.name);
    }

    /// Stop listening and purge the timeline
    pub fn leave(self) {
        self.task.abort();
        self.purge();
        info!("Left public channel {}", self.name);
    }
}

impl Drop for PublicChannel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MeshConfig;
    use crate::relay::{GraphStore, MemoryRelay, RelayBridgeConfig, RelayEndpoint};
    use crate::transport::{LinkOptions, LoopbackNetwork};
    use serde_json::json;
    use std::time::Duration;

    fn hub(store: &Arc<GraphStore>, identity: Option<IdentityKeys>, policy: DeliveryPolicy) -> ChannelHub {
        let peer = identity
            .as_ref()
            .map(|i| i.peer_id())
            .unwrap_or_else(PeerId::anonymous);
        let endpoint: Arc<dyn RelayEndpoint> = Arc::new(MemoryRelay::new("mem://relay", store.clone()));
        let bridge = RelayBridge::new(
            peer.clone(),
            vec![endpoint],
            RelayBridgeConfig::from(&MeshConfig::default()),
        );
        let transport = TransportManager::new(
            peer,
            Arc::new(LoopbackNetwork::new()),
            LinkOptions::default(),
        );
        ChannelHub::new(bridge, transport, identity.map(Arc::new), "tester", policy)
    }

    async fn connected(hub: ChannelHub) -> ChannelHub {
        hub.bridge.connect().await.unwrap();
        hub
    }

    #[tokio::test]
    async fn test_send_public_goes_to_relay() {
        let store = Arc::new(GraphStore::new());
        let hub = connected(hub(&store, None, DeliveryPolicy::DirectAndRelay)).await;

        let report = hub.send_public("general", "hola").await.unwrap();
        assert_eq!(report.direct, 0);
        assert_eq!(report.relay, 1);
        let stored = store.scan_prefix(&channel_prefix(&public_channel("general")));
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].1["text"], "hola");
    }

    #[tokio::test]
    async fn test_send_public_offline_and_alone_fails() {
        let store = Arc::new(GraphStore::new());
        let hub = hub(&store, None, DeliveryPolicy::DirectAndRelay);
        assert!(matches!(
            hub.send_public("general", "anyone?").await,
            Err(ChannelError::Undelivered(_))
        ));
    }

    #[tokio::test]
    async fn test_join_public_sees_relay_history_once() {
        let store = Arc::new(GraphStore::new());
        let sender = connected(hub(&store, None, DeliveryPolicy::RelayOnly)).await;
        let receiver = connected(hub(&store, None, DeliveryPolicy::RelayOnly)).await;

        let first = sender.send_public("general", "one").await.unwrap().message;
        let mut channel = receiver.join_public("general").await.unwrap();
        let second = sender.send_public("general", "two").await.unwrap().message;

        let got_first = tokio::time::timeout(Duration::from_secs(1), channel.recv()).await.unwrap();
        let got_second = tokio::time::timeout(Duration::from_secs(1), channel.recv()).await.unwrap();
        assert_eq!(got_first, Some(first));
        assert_eq!(got_second, Some(second));
        assert_eq!(channel.messages().len(), 2);
        assert_eq!(channel.name(), "general");
    }

    #[tokio::test]
    async fn test_other_channels_ignored() {
        let store = Arc::new(GraphStore::new());
        let sender = connected(hub(&store, None, DeliveryPolicy::RelayOnly)).await;
        let receiver = connected(hub(&store, None, DeliveryPolicy::RelayOnly)).await;

        let mut channel = receiver.join_public("general").await.unwrap();
        sender.send_public("random", "elsewhere").await.unwrap();
        let res = tokio::time::timeout(Duration::from_millis(100), channel.recv()).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_nested_channel_items_not_merged() {
        let store = Arc::new(GraphStore::new());
        let sender = connected(hub(&store, None, DeliveryPolicy::RelayOnly)).await;
        let receiver = connected(hub(&store, None, DeliveryPolicy::RelayOnly)).await;

        let mut channel = receiver.join_public("a").await.unwrap();
        let nested = PublicMessage::new("deeper", "other", "Other");
        sender
            .bridge
            .publish(&public_channel("a/b"), &nested.id, serde_json::to_value(&nested).unwrap())
            .await
            .unwrap();
        let own = sender.send_public("a", "top").await.unwrap().message;

        let got = tokio::time::timeout(Duration::from_secs(1), channel.recv()).await.unwrap();
        assert_eq!(got, Some(own));
        assert_eq!(channel.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_channel_names_with_separator_rejected() {
        let store = Arc::new(GraphStore::new());
        let hub = connected(hub(&store, None, DeliveryPolicy::RelayOnly)).await;
        assert!(matches!(
            hub.send_public("a/b", "x").await,
            Err(ChannelError::InvalidChannel(_))
        ));
        assert!(matches!(hub.join_public("").await, Err(ChannelError::InvalidChannel(_))));
        assert!(store.scan_prefix(&channel_prefix(&public_channel("a"))).is_empty());
    }

    #[tokio::test]
    async fn test_purge_and_leave_clear_timeline() {
        let store = Arc::new(GraphStore::new());
        let sender = connected(hub(&store, None, DeliveryPolicy::RelayOnly)).await;
        let receiver = connected(hub(&store, None, DeliveryPolicy::RelayOnly)).await;

        let mut channel = receiver.join_public("general").await.unwrap();
        sender.send_public("general", "one").await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), channel.recv()).await.unwrap();
        assert_eq!(channel.messages().len(), 1);

        channel.purge();
        assert!(channel.messages().is_empty());

        let second = sender.send_public("general", "two").await.unwrap().message;
        let got = tokio::time::timeout(Duration::from_secs(1), channel.recv()).await.unwrap();
        assert_eq!(got, Some(second));
        assert_eq!(channel.messages().len(), 1);

        let timeline = channel.timeline.clone();
        channel.leave();
        assert!(timeline.lock().is_empty());
    }

    #[tokio::test]
    async fn test_private_requires_identity() {
        let store = Arc::new(GraphStore::new());
        let hub = connected(hub(&store, None, DeliveryPolicy::default())).await;
        let bob = IdentityKeys::generate();
        assert_eq!(
            hub.send_private(&bob.public_key_hex(), "hi").await.unwrap_err(),
            ChannelError::IdentityRequired
        );
        assert_eq!(hub.fetch_inbox().await.unwrap_err(), ChannelError::IdentityRequired);
    }

    #[tokio::test]
    async fn test_private_round_trip_and_wrong_key() {
        let store = Arc::new(GraphStore::new());
        let alice_keys = IdentityKeys::generate();
        let bob_keys = IdentityKeys::generate();
        let bob_pub = bob_keys.public_key_hex();
        let alice = connected(hub(&store, Some(alice_keys), DeliveryPolicy::default())).await;
        let bob = connected(hub(&store, Some(bob_keys), DeliveryPolicy::default())).await;
        let eve = connected(hub(&store, Some(IdentityKeys::generate()), DeliveryPolicy::default())).await;

        let sent = alice.send_private(&bob_pub, "secret").await.unwrap();
        let inbox = bob.fetch_inbox().await.unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].text, "secret");
        assert_eq!(inbox[0].id, sent.id);
        assert_eq!(inbox[0].from, sent.from);

        let raw = store.scan_prefix(&inbox_prefix(&bob_pub));
        let sealed: SealedMessage = serde_json::from_value(raw[0].1.clone()).unwrap();
        assert_eq!(
            eve.open_private(&sealed).unwrap_err(),
            ChannelError::Crypto(crypto::CryptoError::DecryptionFailed)
        );
    }

    #[tokio::test]
    async fn test_inbox_drops_garbage_entries() {
        let store = Arc::new(GraphStore::new());
        let bob_keys = IdentityKeys::generate();
        let prefix = inbox_prefix(&bob_keys.public_key_hex());
        store.put(&format!("{}junk", prefix), json!({"ciphertext": "???", "senderPub": "00", "timestamp": 1}), 1);
        store.put(&format!("{}worse", prefix), json!("not even an object"), 1);

        let bob = connected(hub(&store, Some(bob_keys), DeliveryPolicy::default())).await;
        assert!(bob.fetch_inbox().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_session_sync_round_trip() {
        let store = Arc::new(GraphStore::new());
        let keys = IdentityKeys::generate();
        let secret = keys.to_secret_hex();
        let hub_a = connected(hub(&store, Some(keys), DeliveryPolicy::default())).await;
        // Same identity on a second device
        let hub_b = connected(hub(
            &store,
            Some(IdentityKeys::from_secret_hex(&secret).unwrap()),
            DeliveryPolicy::default(),
        ))
        .await;

        let mut live = hub_b.subscribe_session("s1").await.unwrap();
        let first = hub_a.publish_session("s1", json!({"role": "user", "text": "hi"})).await.unwrap();
        let second = hub_a.publish_session("s1", json!({"role": "bot", "text": "hello"})).await.unwrap();
        assert!(second.timestamp > first.timestamp);

        let got = tokio::time::timeout(Duration::from_secs(1), live.recv()).await.unwrap();
        assert_eq!(got, Some(first.clone()));

        let history = hub_b.fetch_session("s1").await.unwrap();
        assert_eq!(history, vec![first, second]);
        assert!(hub_b.fetch_session("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_session_drops_undecryptable() {
        let store = Arc::new(GraphStore::new());
        let keys = IdentityKeys::generate();
        let prefix = session_prefix(&keys.public_key_hex(), "s1");
        store.put(
            &format!("{}1", prefix),
            json!({"ciphertext": "AAAA", "senderPub": keys.public_key_hex(), "timestamp": 1}),
            1,
        );
        let hub = connected(hub(&store, Some(keys), DeliveryPolicy::default())).await;
        assert!(hub.fetch_session("s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_share_session() {
        let store = Arc::new(GraphStore::new());
        let hub = connected(hub(&store, None, DeliveryPolicy::default())).await;
        let session = json!({"title": "trip", "messages": [1, 2, 3]});
        let id = hub.share_session(&session).await.unwrap();
        assert_eq!(hub.fetch_shared_session(&id).await.unwrap(), session);
        assert!(matches!(
            hub.fetch_shared_session("missing").await,
            Err(ChannelError::Relay(crate::relay::RelayError::NotFound(_)))
        ));
    }
}
