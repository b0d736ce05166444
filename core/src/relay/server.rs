//! Relay Server: hosts the shared graph for mesh clients over WebSocket

use super::graph::GraphStore;
use super::protocol::RelayFrame;
use super::RelayError;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// Maximum concurrent client connections
    pub max_connections: usize,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
        }
    }
}

/// Statistics about relay server operations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayServerStats {
    pub connections_active: usize,
    pub connections_total: u64,
    pub writes_applied: u64,
    pub writes_rejected: u64,
    pub reads_served: u64,
    pub subscriptions: u64,
}

/// The relay server
pub struct RelayServer {
    config: RelayServerConfig,
    store: Arc<GraphStore>,
    stats: Arc<RwLock<RelayServerStats>>,
}

/// Running server; dropping it does not stop the accept loop, call `shutdown`
pub struct RelayServerHandle {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    stats: Arc<RwLock<RelayServerStats>>,
}

impl RelayServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    pub fn stats(&self) -> RelayServerStats {
        self.stats.read().clone()
    }

    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        let _ = self.task.await;
    }

    /// Wait until the accept loop exits
    pub async fn wait(self) {
        let _ = self.task.await;
    }
}

impl RelayServer {
    pub fn new() -> Self {
        Self::with_config(RelayServerConfig::default())
    }

    pub fn with_config(config: RelayServerConfig) -> Self {
        Self {
            config,
            store: Arc::new(GraphStore::new()),
            stats: Arc::new(RwLock::new(RelayServerStats::default())),
        }
    }

    /// Serve an existing graph, e.g. one shared with in-memory endpoints
    pub fn with_store(mut self, store: Arc<GraphStore>) -> Self {
        self.store = store;
        self
    }

    pub fn store(&self) -> &Arc<GraphStore> {
        &self.store
    }

    pub fn stats(&self) -> RelayServerStats {
        self.stats.read().clone()
    }

    /// Bind `addr` and start accepting connections in the background
    pub async fn bind(self, addr: &str) -> Result<RelayServerHandle, RelayError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RelayError::Io(format!("bind {}: {}", addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| RelayError::Io(e.to_string()))?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let stats = self.stats.clone();

        let server = Arc::new(self);
        let task = tokio::spawn(server.serve(listener, shutdown_rx));
        info!("Relay server listening on {}", local_addr);

        Ok(RelayServerHandle {
            local_addr,
            shutdown,
            task,
            stats,
        })
    }

    /// Accept loop; returns when `shutdown` flips to true
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        if self.stats.read().connections_active >= self.config.max_connections {
                            warn!("Connection limit reached, refusing {}", addr);
                            continue;
                        }
                        let server = self.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move { server.handle_connection(stream, addr, shutdown).await });
                    }
                    Err(e) => warn!("Accept failed: {}", e),
                },
            }
        }
        info!("Relay server stopped");
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let ws = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!("WebSocket handshake with {} failed: {}", addr, e);
                return;
            }
        };
        {
            let mut stats = self.stats.write();
            stats.connections_active += 1;
            stats.connections_total += 1;
        }
        debug!("Relay client {} connected", addr);

        let (mut sink, mut source) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        loop {
            let msg = tokio::select! {
                _ = shutdown.changed() => break,
                msg = source.next() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            match msg {
                Ok(Message::Text(text)) => match RelayFrame::from_text(&text) {
                    Ok(frame) => self.handle_frame(frame, &out_tx),
                    Err(e) => warn!("Dropping malformed frame from {}: {}", addr, e),
                },
                Ok(Message::Ping(payload)) => {
                    let _ = out_tx.send(Message::Pong(payload));
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("Relay client {} read error: {}", addr, e);
                    break;
                }
            }
        }

        // Closing the writer ends every subscription task of this client
        writer.abort();
        drop(source);
        self.stats.write().connections_active -= 1;
        debug!("Relay client {} disconnected", addr);
    }

    fn handle_frame(&self, frame: RelayFrame, out: &mpsc::UnboundedSender<Message>) {
        match frame {
            RelayFrame::Put {
                id,
                key,
                value,
                state,
            } => {
                let applied = self.store.put(&key, value, state);
                {
                    let mut stats = self.stats.write();
                    if applied {
                        stats.writes_applied += 1;
                    } else {
                        stats.writes_rejected += 1;
                    }
                }
                // A losing write is still acknowledged, the newer value stands
                send_frame(out, &RelayFrame::Ack { id, err: None });
            }
            RelayFrame::Get { id, key } => {
                self.stats.write().reads_served += 1;
                let value = self.store.get(&key);
                send_frame(out, &RelayFrame::Value { id, key, value });
            }
            RelayFrame::List { id, prefix } => {
                self.stats.write().reads_served += 1;
                let entries = self.store.scan_prefix(&prefix);
                send_frame(out, &RelayFrame::Entries { id, entries });
            }
            RelayFrame::Sub { id, prefix } => {
                self.stats.write().subscriptions += 1;
                let mut updates = self.store.watch();
                let existing = self.store.scan_prefix(&prefix);

                send_frame(out, &RelayFrame::Ack { id, err: None });
                for (key, value) in existing {
                    send_frame(out, &RelayFrame::Update { sub: id, key, value });
                }

                let out = out.clone();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = out.closed() => break,
                            update = updates.recv() => match update {
                                Ok((key, value)) => {
                                    if key.starts_with(&prefix)
                                        && !send_frame(&out, &RelayFrame::Update { sub: id, key, value })
                                    {
                                        break;
                                    }
                                }
                                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                    warn!("Subscription {} lagged, skipped {} updates", prefix, skipped);
                                }
                                Err(broadcast::error::RecvError::Closed) => break,
                            },
                        }
                    }
                });
            }
            RelayFrame::Ping { id } => {
                send_frame(out, &RelayFrame::Pong { id });
            }
            other => debug!("Ignoring client-sent {} frame", other.message_type()),
        }
    }
}

impl Default for RelayServer {
    fn default() -> Self {
        Self::new()
    }
}

fn send_frame(out: &mpsc::UnboundedSender<Message>, frame: &RelayFrame) -> bool {
    match frame.to_text() {
        Ok(text) => out.send(Message::Text(text)).is_ok(),
        Err(e) => {
            warn!("Failed to encode {} frame: {}", frame.message_type(), e);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<RelayFrame> {
        let mut frames = Vec::new();
        while let Ok(Message::Text(text)) = rx.try_recv() {
            frames.push(RelayFrame::from_text(&text).unwrap());
        }
        frames
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let server = RelayServer::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        server.handle_frame(
            RelayFrame::Put {
                id: 1,
                key: "a/b".into(),
                value: json!("v"),
                state: 5,
            },
            &tx,
        );
        server.handle_frame(RelayFrame::Get { id: 2, key: "a/b".into() }, &tx);
        server.handle_frame(RelayFrame::Get { id: 3, key: "a/c".into() }, &tx);

        assert_eq!(
            drain(&mut rx),
            vec![
                RelayFrame::Ack { id: 1, err: None },
                RelayFrame::Value {
                    id: 2,
                    key: "a/b".into(),
                    value: Some(json!("v"))
                },
                RelayFrame::Value {
                    id: 3,
                    key: "a/c".into(),
                    value: None
                },
            ]
        );
        assert_eq!(server.stats().writes_applied, 1);
        assert_eq!(server.stats().reads_served, 2);
    }

    #[tokio::test]
    async fn test_stale_write_acked_but_not_applied() {
        let server = RelayServer::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        server.store().put("k", json!("new"), 10);

        server.handle_frame(
            RelayFrame::Put {
                id: 1,
                key: "k".into(),
                value: json!("old"),
                state: 1,
            },
            &tx,
        );
        assert_eq!(drain(&mut rx), vec![RelayFrame::Ack { id: 1, err: None }]);
        assert_eq!(server.store().get("k"), Some(json!("new")));
        assert_eq!(server.stats().writes_rejected, 1);
    }

    #[tokio::test]
    async fn test_sub_replays_existing_entries() {
        let server = RelayServer::new();
        server.store().put("room/1", json!(1), 1);
        server.store().put("other/1", json!(2), 1);
        let (tx, mut rx) = mpsc::unbounded_channel();

        server.handle_frame(RelayFrame::Sub { id: 4, prefix: "room/".into() }, &tx);
        assert_eq!(
            drain(&mut rx),
            vec![
                RelayFrame::Ack { id: 4, err: None },
                RelayFrame::Update {
                    sub: 4,
                    key: "room/1".into(),
                    value: json!(1)
                },
            ]
        );

        server.store().put("room/2", json!(3), 2);
        let next = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match next {
            Message::Text(text) => assert_eq!(
                RelayFrame::from_text(&text).unwrap(),
                RelayFrame::Update {
                    sub: 4,
                    key: "room/2".into(),
                    value: json!(3)
                }
            ),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ping_pong_and_ignored_frames() {
        let server = RelayServer::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        server.handle_frame(RelayFrame::Ping { id: 9 }, &tx);
        server.handle_frame(RelayFrame::Pong { id: 1 }, &tx);
        assert_eq!(drain(&mut rx), vec![RelayFrame::Pong { id: 9 }]);
    }

    #[tokio::test]
    async fn test_bind_and_shutdown() {
        let handle = RelayServer::new().bind("127.0.0.1:0").await.unwrap();
        assert!(handle.url().starts_with("ws://127.0.0.1:"));
        assert_eq!(handle.stats().connections_active, 0);
        handle.shutdown().await;
    }
}
