//! Signaling server: WebSocket rendezvous that forwards negotiation envelopes

use super::types::SignalingFrame;
use super::SignalingError;
use crate::identity::PeerId;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Rendezvous server. Knows nothing about the mesh beyond peer ids.
#[derive(Default)]
pub struct SignalingServer {
    peers: RwLock<HashMap<PeerId, mpsc::UnboundedSender<Message>>>,
}

pub struct SignalingServerHandle {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    server: Arc<SignalingServer>,
}

impl SignalingServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    pub fn peer_count(&self) -> usize {
        self.server.peer_count()
    }

    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        let _ = self.task.await;
    }

    pub async fn wait(self) {
        let _ = self.task.await;
    }
}

impl SignalingServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    pub async fn bind(self, addr: &str) -> Result<SignalingServerHandle, SignalingError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SignalingError::Io(format!("bind {}: {}", addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| SignalingError::Io(e.to_string()))?;
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let server = Arc::new(self);

        let accept_server = server.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            let server = accept_server.clone();
                            let shutdown = shutdown_rx.clone();
                            tokio::spawn(async move { server.handle_connection(stream, addr, shutdown).await });
                        }
                        Err(e) => warn!("Accept failed: {}", e),
                    },
                }
            }
            info!("Signaling server stopped");
        });
        info!("Signaling server listening on {}", local_addr);

        Ok(SignalingServerHandle {
            local_addr,
            shutdown,
            task,
            server,
        })
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

        let mut registered: Option<PeerId> = None;
        loop {
            let msg = tokio::select! {
                _ = shutdown.changed() => break,
                msg = source.next() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            let text = match msg {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => break,
                Ok(Message::Ping(payload)) => {
                    let _ = out_tx.send(Message::Pong(payload));
                    continue;
                }
                Ok(_) => continue,
                Err(e) => {
                    debug!("Signaling client {} read error: {}", addr, e);
                    break;
                }
            };
            let frame = match SignalingFrame::from_text(&text) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Dropping malformed frame from {}: {}", addr, e);
                    continue;
                }
            };

            match frame {
                SignalingFrame::Register { peer_id } => {
                    if let Some(previous) = registered.take() {
                        self.unregister(&previous, &out_tx);
                    }
                    info!("Peer {} registered from {}", peer_id.short(), addr);
                    self.peers.write().insert(peer_id.clone(), out_tx.clone());
                    self.broadcast_except(
                        &peer_id,
                        &SignalingFrame::PeerJoined {
                            peer_id: peer_id.clone(),
                        },
                    );
                    registered = Some(peer_id);
                }
                SignalingFrame::Signal { mut signal } => {
                    let Some(from) = registered.clone() else {
                        debug!("Signal from unregistered client {} dropped", addr);
                        continue;
                    };
                    signal.from = from;
                    self.forward(SignalingFrame::Signal { signal });
                }
                other => debug!("Ignoring client-sent frame {:?}", other),
            }
        }

        if let Some(peer_id) = registered {
            self.unregister(&peer_id, &out_tx);
        }
        writer.abort();
    }

    fn forward(&self, frame: SignalingFrame) {
        let SignalingFrame::Signal { signal } = &frame else {
            return;
        };
        let target = self.peers.read().get(&signal.to).cloned();
        match (target, frame.to_text()) {
            (Some(out), Ok(text)) => {
                let _ = out.send(Message::Text(text));
            }
            (None, _) => debug!("Signal for unknown peer {} dropped", signal.to),
            (_, Err(e)) => warn!("Failed to encode signal: {}", e),
        }
    }

    /// Drop `peer_id` if it is still bound to `connection`. A peer that has
    /// already re-registered on a newer socket is left alone.
    fn unregister(&self, peer_id: &PeerId, connection: &mpsc::UnboundedSender<Message>) {
        let removed = {
            let mut peers = self.peers.write();
            match peers.get(peer_id) {
                Some(current) if current.same_channel(connection) => peers.remove(peer_id).is_some(),
                _ => false,
            }
        };
        if removed {
            info!("Peer {} left", peer_id.short());
            self.broadcast_except(
                peer_id,
                &SignalingFrame::PeerLeft {
                    peer_id: peer_id.clone(),
                },
            );
        }
    }

    fn broadcast_except(&self, origin: &PeerId, frame: &SignalingFrame) {
        let text = match frame.to_text() {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode frame: {}", e);
                return;
            }
        };
        for (peer_id, out) in self.peers.read().iter() {
            if peer_id != origin {
                let _ = out.send(Message::Text(text.clone()));
            }
        }
    }
}
