//! Relay endpoint abstraction: one connection to one relay

use super::graph::GraphStore;
use super::RelayError;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, warn};

/// Stream of `(key, value)` writes under a subscribed prefix
pub type GraphFeed = mpsc::UnboundedReceiver<(String, Value)>;

/// A single relay the bridge can talk to.
///
/// Implementations are cheap to share behind `Arc` and must tolerate
/// `connect()` being called again after the connection dropped.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RelayEndpoint: Send + Sync {
    fn url(&self) -> String;

    fn is_connected(&self) -> bool;

    async fn connect(&self) -> Result<(), RelayError>;

    async fn close(&self);

    /// Write with acknowledgement
    async fn put(&self, key: &str, value: Value, state: u64) -> Result<(), RelayError>;

    async fn get(&self, key: &str) -> Result<Option<Value>, RelayError>;

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>, RelayError>;

    /// Replays existing entries under `prefix`, then streams live writes.
    /// The feed ends when the connection drops.
    async fn subscribe(&self, prefix: &str) -> Result<GraphFeed, RelayError>;

    async fn ping(&self) -> Result<(), RelayError>;
}

/// Relay endpoint backed by an in-process [`GraphStore`].
///
/// Several endpoints sharing one store behave like several clients of the
/// same relay. Reachability can be toggled to simulate outages.
pub struct MemoryRelay {
    url: String,
    store: Arc<GraphStore>,
    reachable: AtomicBool,
    connected: watch::Sender<bool>,
}

impl MemoryRelay {
    pub fn new(url: impl Into<String>, store: Arc<GraphStore>) -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            url: url.into(),
            store,
            reachable: AtomicBool::new(true),
            connected,
        }
    }

    /// Endpoint whose connect attempts always fail
    pub fn unreachable(url: impl Into<String>) -> Self {
        let relay = Self::new(url, Arc::new(GraphStore::new()));
        relay.reachable.store(false, Ordering::SeqCst);
        relay
    }

    pub fn store(&self) -> &Arc<GraphStore> {
        &self.store
    }

    /// Going unreachable drops the current connection and its feeds
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
        if !reachable {
            self.connected.send_replace(false);
        }
    }

    fn ensure_connected(&self) -> Result<(), RelayError> {
        if !self.reachable.load(Ordering::SeqCst) {
            self.connected.send_replace(false);
            return Err(RelayError::ConnectionLost(self.url.clone()));
        }
        if !*self.connected.borrow() {
            return Err(RelayError::NotConnected);
        }
        Ok(())
    }
}

#[async_trait]
impl RelayEndpoint for MemoryRelay {
    fn url(&self) -> String {
        self.url.clone()
    }

    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    async fn connect(&self) -> Result<(), RelayError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(RelayError::Unreachable(self.url.clone()));
        }
        self.connected.send_replace(true);
        Ok(())
    }

    async fn close(&self) {
        self.connected.send_replace(false);
    }

    async fn put(&self, key: &str, value: Value, state: u64) -> Result<(), RelayError> {
        self.ensure_connected()?;
        self.store.put(key, value, state);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, RelayError> {
        self.ensure_connected()?;
        Ok(self.store.get(key))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>, RelayError> {
        self.ensure_connected()?;
        Ok(self.store.scan_prefix(prefix))
    }

    async fn subscribe(&self, prefix: &str) -> Result<GraphFeed, RelayError> {
        self.ensure_connected()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut updates = self.store.watch();
        for item in self.store.scan_prefix(prefix) {
            let _ = tx.send(item);
        }

        let prefix = prefix.to_string();
        let url = self.url.clone();
        let mut connected = self.connected.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    changed = connected.changed() => {
                        if changed.is_err() || !*connected.borrow() {
                            debug!("Memory relay {} feed for {} closed", url, prefix);
                            break;
                        }
                    }
                    update = updates.recv() => match update {
                        Ok((key, value)) => {
                            if key.starts_with(&prefix) && tx.send((key, value)).is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Memory relay {} feed lagged, skipped {} updates", url, skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        Ok(rx)
    }

    async fn ping(&self) -> Result<(), RelayError> {
        self.ensure_connected()
    }
}
