//! Signaling client: registers with the rendezvous server and relays envelopes

use super::types::{SignalEnvelope, SignalingEvent, SignalingFrame};
use super::SignalingError;
use crate::identity::PeerId;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Control-plane channel used by the transport manager
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Announce `local` and start receiving events addressed to it
    async fn register(
        &self,
        local: &PeerId,
    ) -> Result<mpsc::UnboundedReceiver<SignalingEvent>, SignalingError>;

    async fn send(&self, envelope: SignalEnvelope) -> Result<(), SignalingError>;

    async fn close(&self);
}

/// WebSocket signaling client
pub struct WsSignalingClient {
    url: String,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

impl WsSignalingClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            outbound: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Map a server frame to an event for `local`, dropping what isn't ours
    fn translate(local: &PeerId, frame: SignalingFrame) -> Option<SignalingEvent> {
        match frame {
            SignalingFrame::PeerJoined { peer_id } if &peer_id != local => {
                Some(SignalingEvent::PeerJoined(peer_id))
            }
            SignalingFrame::PeerLeft { peer_id } if &peer_id != local => {
                Some(SignalingEvent::PeerLeft(peer_id))
            }
            SignalingFrame::Signal { signal } => {
                if &signal.to != local {
                    debug!("Dropping signal addressed to {}", signal.to);
                    return None;
                }
                match signal.validate() {
                    Ok(signal) => Some(SignalingEvent::Signal(signal)),
                    Err(e) => {
                        warn!("Dropping malformed signal: {}", e);
                        None
                    }
                }
            }
            _ => None,
        }
    }
}

#[async_trait]
impl SignalingChannel for WsSignalingClient {
    async fn register(
        &self,
        local: &PeerId,
    ) -> Result<mpsc::UnboundedReceiver<SignalingEvent>, SignalingError> {
        let (stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(format!("{}: {}", self.url, e)))?;
        let (mut sink, mut source) = stream.split();

        let register = SignalingFrame::Register {
            peer_id: local.clone(),
        }
        .to_text()?;
        sink.send(Message::Text(register))
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let local = local.clone();
        let url = self.url.clone();
        let pong_tx = out_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = source.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Ping(payload)) => {
                        let _ = pong_tx.send(Message::Pong(payload));
                        continue;
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!("Signaling read error: {}", e);
                        break;
                    }
                };
                let frame = match SignalingFrame::from_text(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Dropping malformed signaling frame: {}", e);
                        continue;
                    }
                };
                if let Some(event) = Self::translate(&local, frame) {
                    if events_tx.send(event).is_err() {
                        break;
                    }
                }
            }
            info!("Signaling connection to {} closed", url);
            let _ = events_tx.send(SignalingEvent::Disconnected);
        });

        *self.outbound.lock() = Some(out_tx);
        info!("Registered with signaling server {}", self.url);
        Ok(events_rx)
    }

    async fn send(&self, envelope: SignalEnvelope) -> Result<(), SignalingError> {
        let text = SignalingFrame::Signal { signal: envelope }.to_text()?;
        match self.outbound.lock().as_ref() {
            Some(out) => out
                .send(Message::Text(text))
                .map_err(|_| SignalingError::Closed),
            None => Err(SignalingError::NotRegistered),
        }
    }

    async fn close(&self) {
        if let Some(out) = self.outbound.lock().take() {
            let _ = out.send(Message::Close(None));
        }
    }
}
