//! Relay Bridge: presence, channels, inboxes and shares over a set of relays
//!
//! Writes go to every connected relay; reads take the first relay that has
//! the key. Relays that are down are retried in the background with
//! exponential backoff, and subscriptions are re-attached on reconnect.

use super::client::WsRelayEndpoint;
use super::endpoint::{GraphFeed, RelayEndpoint};
use super::protocol::{
    channel_prefix, pulse_key, pulse_prefix, self_test_key, share_key, key_leaf, PresencePulse,
    ShareRecord,
};
use super::RelayError;
use crate::config::{backoff_duration, MeshConfig};
use crate::identity::{random_token, PeerId};
use crate::now_millis;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Relay bridge timing
#[derive(Debug, Clone)]
pub struct RelayBridgeConfig {
    pub connect_timeout: Duration,
    pub self_test_timeout: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    /// How often a connected relay is checked for a dropped connection
    pub health_check_interval: Duration,
    /// Platform tag carried in presence pulses
    pub platform: String,
}

impl Default for RelayBridgeConfig {
    fn default() -> Self {
        Self::from(&MeshConfig::default())
    }
}

impl From<&MeshConfig> for RelayBridgeConfig {
    fn from(config: &MeshConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            self_test_timeout: config.self_test_timeout(),
            reconnect_base: config.reconnect_base(),
            reconnect_max: config.reconnect_max(),
            health_check_interval: config.heartbeat_interval(),
            platform: config.platform.clone(),
        }
    }
}

/// Snapshot of relay connectivity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayHealth {
    pub configured: usize,
    pub connected: usize,
    /// Outcome of the most recent write round-trip
    pub last_self_test: Option<bool>,
    pub last_self_test_at: Option<u64>,
}

impl RelayHealth {
    pub fn is_online(&self) -> bool {
        self.connected > 0
    }
}

struct Subscription {
    prefix: String,
    sink: mpsc::UnboundedSender<(String, Value)>,
}

struct BridgeInner {
    local_peer: PeerId,
    config: RelayBridgeConfig,
    endpoints: Vec<Arc<dyn RelayEndpoint>>,
    subscriptions: Mutex<Vec<Subscription>>,
    last_self_test: Mutex<Option<(bool, u64)>>,
    supervising: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl BridgeInner {
    fn connected_endpoints(&self) -> Vec<Arc<dyn RelayEndpoint>> {
        self.endpoints
            .iter()
            .filter(|e| e.is_connected())
            .cloned()
            .collect()
    }

    async fn attempt(self: &Arc<Self>, endpoint: &Arc<dyn RelayEndpoint>) -> Result<(), RelayError> {
        match timeout(self.config.connect_timeout, endpoint.connect()).await {
            Ok(Ok(())) => {
                self.attach_subscriptions(endpoint).await;
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RelayError::Timeout(self.config.connect_timeout)),
        }
    }

    async fn attach_subscriptions(&self, endpoint: &Arc<dyn RelayEndpoint>) {
        let subscriptions: Vec<(String, mpsc::UnboundedSender<(String, Value)>)> = {
            let mut subs = self.subscriptions.lock();
            subs.retain(|s| !s.sink.is_closed());
            subs.iter()
                .map(|s| (s.prefix.clone(), s.sink.clone()))
                .collect()
        };
        for (prefix, sink) in subscriptions {
            Self::attach_one(endpoint, prefix, sink).await;
        }
    }

    async fn attach_one(
        endpoint: &Arc<dyn RelayEndpoint>,
        prefix: String,
        sink: mpsc::UnboundedSender<(String, Value)>,
    ) {
        let mut feed = match endpoint.subscribe(&prefix).await {
            Ok(feed) => feed,
            Err(e) => {
                warn!("Subscribe to {} on {} failed: {}", prefix, endpoint.url(), e);
                return;
            }
        };
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sink.closed() => break,
                    item = feed.recv() => match item {
                        Some(item) => {
                            if sink.send(item).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });
    }

    fn spawn_supervisor(self: &Arc<Self>, endpoint: Arc<dyn RelayEndpoint>) {
        let inner = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let idle = inner.config.health_check_interval;
            let mut attempt: u32 = 0;
            let mut delay = inner.config.connect_timeout.max(idle);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = sleep(delay) => {}
                }
                if *shutdown.borrow() {
                    break;
                }
                if endpoint.is_connected() {
                    match timeout(inner.config.connect_timeout, endpoint.ping()).await {
                        Ok(Ok(())) => {
                            attempt = 0;
                            delay = idle;
                            continue;
                        }
                        Ok(Err(e)) => warn!("Relay {} failed liveness check: {}", endpoint.url(), e),
                        Err(_) => warn!("Relay {} did not answer ping", endpoint.url()),
                    }
                    endpoint.close().await;
                }
                match inner.attempt(&endpoint).await {
                    Ok(()) => {
                        info!("Reconnected to relay {}", endpoint.url());
                        attempt = 0;
                        delay = idle;
                    }
                    Err(e) => {
                        delay = backoff_duration(
                            inner.config.reconnect_base,
                            inner.config.reconnect_max,
                            attempt,
                        );
                        attempt = attempt.saturating_add(1);
                        debug!(
                            "Relay {} unreachable ({}), retry in {:?}",
                            endpoint.url(),
                            e,
                            delay
                        );
                    }
                }
            }
            debug!("Supervisor for {} stopped", endpoint.url());
        });
    }
}

/// Handle to the relay network. Cloning shares the same connections.
#[derive(Clone)]
pub struct RelayBridge {
    inner: Arc<BridgeInner>,
}

impl RelayBridge {
    pub fn new(
        local_peer: PeerId,
        endpoints: Vec<Arc<dyn RelayEndpoint>>,
        config: RelayBridgeConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(BridgeInner {
                local_peer,
                config,
                endpoints,
                subscriptions: Mutex::new(Vec::new()),
                last_self_test: Mutex::new(None),
                supervising: AtomicBool::new(false),
                shutdown,
            }),
        }
    }

    /// Bridge over WebSocket relays listed in `config.relays`
    pub fn from_config(local_peer: PeerId, config: &MeshConfig) -> Self {
        let endpoints = config
            .relays
            .iter()
            .map(|url| {
                Arc::new(WsRelayEndpoint::new(url.clone(), config.request_timeout()))
                    as Arc<dyn RelayEndpoint>
            })
            .collect();
        Self::new(local_peer, endpoints, RelayBridgeConfig::from(config))
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.inner.local_peer
    }

    pub fn connected_count(&self) -> usize {
        self.inner.connected_endpoints().len()
    }

    /// Try every relay concurrently; succeed as soon as one answers.
    ///
    /// Relays still connecting keep going in the background and relays that
    /// failed are handed to a reconnect supervisor. Returns the number of
    /// relays connected when the call resolved.
    pub async fn connect(&self) -> Result<usize, RelayError> {
        if self.inner.endpoints.is_empty() {
            return Err(RelayError::NoRelaysConfigured);
        }

        if !self.inner.supervising.swap(true, Ordering::SeqCst) {
            for endpoint in &self.inner.endpoints {
                self.inner.spawn_supervisor(endpoint.clone());
            }
        }

        let already = self.connected_count();
        if already > 0 {
            return Ok(already);
        }

        let mut attempts = FuturesUnordered::new();
        for endpoint in &self.inner.endpoints {
            let inner = self.inner.clone();
            let endpoint = endpoint.clone();
            attempts.push(async move {
                let result = inner.attempt(&endpoint).await;
                (endpoint.url(), result)
            });
        }

        while let Some((url, result)) = attempts.next().await {
            match result {
                Ok(()) => {
                    info!("Relay {} reachable", url);
                    tokio::spawn(async move {
                        while let Some((url, result)) = attempts.next().await {
                            match result {
                                Ok(()) => info!("Relay {} reachable", url),
                                Err(e) => debug!("Relay {} unreachable: {}", url, e),
                            }
                        }
                    });
                    return Ok(self.connected_count().max(1));
                }
                Err(e) => warn!("Relay {} unreachable: {}", url, e),
            }
        }

        Err(RelayError::NoRelayReachable)
    }

    /// Write to every connected relay; succeeds if at least one acknowledged
    pub async fn put(&self, key: &str, value: Value) -> Result<usize, RelayError> {
        let targets = self.inner.connected_endpoints();
        if targets.is_empty() {
            return Err(RelayError::NotConnected);
        }

        let state = now_millis();
        let results = futures::future::join_all(
            targets
                .iter()
                .map(|endpoint| endpoint.put(key, value.clone(), state)),
        )
        .await;

        let mut acked = 0;
        let mut last_error = None;
        for (endpoint, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => acked += 1,
                Err(e) => {
                    debug!("Write of {} to {} failed: {}", key, endpoint.url(), e);
                    last_error = Some(e);
                }
            }
        }

        match (acked, last_error) {
            (0, Some(e)) => Err(e),
            (0, None) => Err(RelayError::NotConnected),
            (n, _) => Ok(n),
        }
    }

    /// First value found on any connected relay
    pub async fn get(&self, key: &str) -> Result<Option<Value>, RelayError> {
        let targets = self.inner.connected_endpoints();
        if targets.is_empty() {
            return Err(RelayError::NotConnected);
        }

        let mut answered = false;
        let mut last_error = None;
        for endpoint in targets {
            match endpoint.get(key).await {
                Ok(Some(value)) => return Ok(Some(value)),
                Ok(None) => answered = true,
                Err(e) => {
                    debug!("Read of {} from {} failed: {}", key, endpoint.url(), e);
                    last_error = Some(e);
                }
            }
        }

        match (answered, last_error) {
            (false, Some(e)) => Err(e),
            _ => Ok(None),
        }
    }

    /// Union of every connected relay's entries under `prefix`
    pub async fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>, RelayError> {
        let targets = self.inner.connected_endpoints();
        if targets.is_empty() {
            return Err(RelayError::NotConnected);
        }

        let mut merged = BTreeMap::new();
        let mut answered = false;
        let mut last_error = None;
        for endpoint in targets {
            match endpoint.list(prefix).await {
                Ok(entries) => {
                    answered = true;
                    for (key, value) in entries {
                        merged.entry(key).or_insert(value);
                    }
                }
                Err(e) => last_error = Some(e),
            }
        }

        match (answered, last_error) {
            (false, Some(e)) => Err(e),
            _ => Ok(merged.into_iter().collect()),
        }
    }

    /// Feed of writes under `prefix` from every relay, present and future.
    ///
    /// Does not fail while offline: the subscription is attached to each
    /// relay as it connects. Duplicates across relays are possible.
    pub async fn subscribe_prefix(&self, prefix: &str) -> GraphFeed {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscriptions.lock().push(Subscription {
            prefix: prefix.to_string(),
            sink: tx.clone(),
        });
        for endpoint in self.inner.connected_endpoints() {
            BridgeInner::attach_one(&endpoint, prefix.to_string(), tx.clone()).await;
        }
        rx
    }

    pub async fn emit_presence(&self, peer_id: &PeerId) -> Result<(), RelayError> {
        let pulse = PresencePulse::online(now_millis(), self.inner.config.platform.clone());
        let value =
            serde_json::to_value(&pulse).map_err(|e| RelayError::Serialization(e.to_string()))?;
        self.put(&pulse_key(peer_id.as_str()), value).await?;
        Ok(())
    }

    /// Every pulse seen on the relays, including the ones written before
    /// this call. Malformed pulses are dropped.
    pub async fn subscribe_presence(&self) -> mpsc::UnboundedReceiver<(PeerId, PresencePulse)> {
        let mut feed = self.subscribe_prefix(&pulse_prefix()).await;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some((key, value)) = feed.recv().await {
                let peer_id = PeerId::new(key_leaf(&key));
                match serde_json::from_value::<PresencePulse>(value) {
                    Ok(pulse) => {
                        if tx.send((peer_id, pulse)).is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!("Dropping malformed pulse from {}: {}", peer_id, e),
                }
            }
        });
        rx
    }

    /// Append `value` to `channel` under `item_id`
    pub async fn publish(&self, channel: &str, item_id: &str, value: Value) -> Result<usize, RelayError> {
        self.put(&format!("{}{}", channel_prefix(channel), item_id), value)
            .await
    }

    /// Feed of `(graph key, value)` for every item published to `channel`
    pub async fn subscribe(&self, channel: &str) -> GraphFeed {
        self.subscribe_prefix(&channel_prefix(channel)).await
    }

    /// Store `data` under a fresh share id
    pub async fn share_snapshot(&self, data: &Value) -> Result<String, RelayError> {
        let share_id = random_token(13);
        let record = ShareRecord {
            data: data.to_string(),
            timestamp: now_millis(),
            author: self.inner.local_peer.to_string(),
        };
        let value =
            serde_json::to_value(&record).map_err(|e| RelayError::Serialization(e.to_string()))?;
        self.put(&share_key(&share_id), value).await?;
        info!("Shared snapshot {}", share_id);
        Ok(share_id)
    }

    pub async fn fetch_snapshot(&self, share_id: &str) -> Result<Value, RelayError> {
        let value = self
            .get(&share_key(share_id))
            .await?
            .ok_or_else(|| RelayError::NotFound(share_id.to_string()))?;
        let record: ShareRecord = serde_json::from_value(value)
            .map_err(|e| RelayError::Corrupted(format!("{}: {}", share_id, e)))?;
        serde_json::from_str(&record.data)
            .map_err(|e| RelayError::Corrupted(format!("{}: {}", share_id, e)))
    }

    /// Round-trip write bounded by the self-test timeout
    pub async fn self_test(&self) -> bool {
        let started = now_millis();
        let key = self_test_key(&format!("{}-{}", self.inner.local_peer.short(), started));
        let probe = json!({ "hello": "world", "at": started });

        let passed = matches!(
            timeout(self.inner.config.self_test_timeout, self.put(&key, probe)).await,
            Ok(Ok(_))
        );
        if passed {
            info!("Relay self-test passed in {}ms", now_millis().saturating_sub(started));
        } else {
            warn!("Relay self-test failed");
        }
        *self.inner.last_self_test.lock() = Some((passed, started));
        passed
    }

    pub fn health(&self) -> RelayHealth {
        let last = *self.inner.last_self_test.lock();
        RelayHealth {
            configured: self.inner.endpoints.len(),
            connected: self.connected_count(),
            last_self_test: last.map(|(passed, _)| passed),
            last_self_test_at: last.map(|(_, at)| at),
        }
    }

    /// Stop reconnect supervisors and close every relay connection
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        for endpoint in &self.inner.endpoints {
            endpoint.close().await;
        }
        self.inner.subscriptions.lock().clear();
    }
}
