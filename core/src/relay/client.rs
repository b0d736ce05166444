//! WebSocket relay endpoint: request/response and subscriptions over one socket

use super::endpoint::{GraphFeed, RelayEndpoint};
use super::protocol::RelayFrame;
use super::RelayError;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<RelayFrame>>>>;
type FeedMap = Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<(String, Value)>>>>;

/// Relay reached over `ws://` / `wss://`
pub struct WsRelayEndpoint {
    url: String,
    request_timeout: Duration,
    next_id: AtomicU64,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    pending: PendingMap,
    feeds: FeedMap,
    connected: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
}

impl WsRelayEndpoint {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            request_timeout,
            next_id: AtomicU64::new(1),
            outbound: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            feeds: Arc::new(Mutex::new(HashMap::new())),
            connected: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    fn dispatch(pending: &PendingMap, feeds: &FeedMap, text: &str) {
        let frame = match RelayFrame::from_text(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping malformed relay frame: {}", e);
                return;
            }
        };

        if let RelayFrame::Update { sub, key, value } = frame {
            let mut feeds = feeds.lock();
            let closed = match feeds.get(&sub) {
                Some(feed) => feed.send((key, value)).is_err(),
                None => false,
            };
            if closed {
                feeds.remove(&sub);
            }
            return;
        }

        match frame.response_id() {
            Some(id) => {
                if let Some(waiter) = pending.lock().remove(&id) {
                    let _ = waiter.send(frame);
                }
            }
            None => debug!("Ignoring unexpected {} frame", frame.message_type()),
        }
    }

    async fn request(&self, build: impl FnOnce(u64) -> RelayFrame) -> Result<RelayFrame, RelayError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let text = build(id).to_text()?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let sent = match self.outbound.lock().as_ref() {
            Some(out) => out.send(Message::Text(text)).is_ok(),
            None => false,
        };
        if !sent {
            self.pending.lock().remove(&id);
            return Err(RelayError::NotConnected);
        }

        match timeout(self.request_timeout, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(RelayError::ConnectionLost(self.url.clone())),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(RelayError::Timeout(self.request_timeout))
            }
        }
    }

    fn expect_ack(frame: RelayFrame) -> Result<(), RelayError> {
        match frame {
            RelayFrame::Ack { err: None, .. } => Ok(()),
            RelayFrame::Ack { err: Some(e), .. } => Err(RelayError::Rejected(e)),
            other => Err(RelayError::Protocol(format!(
                "expected ack, got {}",
                other.message_type()
            ))),
        }
    }
}

#[async_trait]
impl RelayEndpoint for WsRelayEndpoint {
    fn url(&self) -> String {
        self.url.clone()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> Result<(), RelayError> {
        let (stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| RelayError::ConnectionFailed(format!("{}: {}", self.url, e)))?;
        let (mut sink, mut source) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let pending = self.pending.clone();
        let feeds = self.feeds.clone();
        let connected = self.connected.clone();
        let current = self.generation.clone();
        let url = self.url.clone();
        let pong_tx = out_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = source.next().await {
                match msg {
                    Ok(Message::Text(text)) => Self::dispatch(&pending, &feeds, &text),
                    Ok(Message::Ping(payload)) => {
                        let _ = pong_tx.send(Message::Pong(payload));
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!("Relay {} read error: {}", url, e);
                        break;
                    }
                }
            }
            if current.load(Ordering::SeqCst) == generation {
                connected.store(false, Ordering::SeqCst);
                pending.lock().clear();
                feeds.lock().clear();
            }
            info!("Relay {} disconnected", url);
        });

        *self.outbound.lock() = Some(out_tx);
        self.connected.store(true, Ordering::SeqCst);
        info!("Connected to relay {}", self.url);
        Ok(())
    }

    async fn close(&self) {
        if let Some(out) = self.outbound.lock().take() {
            let _ = out.send(Message::Close(None));
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn put(&self, key: &str, value: Value, state: u64) -> Result<(), RelayError> {
        let key = key.to_string();
        let frame = self
            .request(|id| RelayFrame::Put {
                id,
                key,
                value,
                state,
            })
            .await?;
        Self::expect_ack(frame)
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, RelayError> {
        let key = key.to_string();
        match self.request(|id| RelayFrame::Get { id, key }).await? {
            RelayFrame::Value { value, .. } => Ok(value),
            other => Err(RelayError::Protocol(format!(
                "expected value, got {}",
                other.message_type()
            ))),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>, RelayError> {
        let prefix = prefix.to_string();
        match self.request(|id| RelayFrame::List { id, prefix }).await? {
            RelayFrame::Entries { entries, .. } => Ok(entries),
            other => Err(RelayError::Protocol(format!(
                "expected entries, got {}",
                other.message_type()
            ))),
        }
    }

    async fn subscribe(&self, prefix: &str) -> Result<GraphFeed, RelayError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.feeds.lock().insert(sub_id, tx);

        let prefix = prefix.to_string();
        let result = self
            .request(|_| RelayFrame::Sub { id: sub_id, prefix })
            .await
            .and_then(Self::expect_ack);
        if let Err(e) = result {
            self.feeds.lock().remove(&sub_id);
            return Err(e);
        }
        Ok(rx)
    }

    async fn ping(&self) -> Result<(), RelayError> {
        match self.request(|id| RelayFrame::Ping { id }).await? {
            RelayFrame::Pong { .. } => Ok(()),
            other => Err(RelayError::Protocol(format!(
                "expected pong, got {}",
                other.message_type()
            ))),
        }
    }
}
