//! In-process signaling hub, same semantics as the rendezvous server

use super::client::SignalingChannel;
use super::types::{SignalEnvelope, SignalingEvent};
use super::SignalingError;
use crate::identity::PeerId;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Rendezvous point shared by several in-process nodes
#[derive(Default)]
pub struct MemorySignalingHub {
    peers: Mutex<HashMap<PeerId, mpsc::UnboundedSender<SignalingEvent>>>,
}

impl MemorySignalingHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A fresh client connection to this hub
    pub fn channel(self: &Arc<Self>) -> MemorySignaling {
        MemorySignaling {
            hub: self.clone(),
            local: Mutex::new(None),
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    /// Drop a peer as if its socket closed
    pub fn disconnect(&self, peer_id: &PeerId) {
        let removed = self.peers.lock().remove(peer_id);
        if let Some(events) = removed {
            let _ = events.send(SignalingEvent::Disconnected);
            self.broadcast_except(peer_id, SignalingEvent::PeerLeft(peer_id.clone()));
        }
    }

    fn broadcast_except(&self, origin: &PeerId, event: SignalingEvent) {
        let peers = self.peers.lock();
        for (peer_id, events) in peers.iter() {
            if peer_id != origin {
                let _ = events.send(event.clone());
            }
        }
    }
}

/// One node's connection to a [`MemorySignalingHub`]
pub struct MemorySignaling {
    hub: Arc<MemorySignalingHub>,
    local: Mutex<Option<PeerId>>,
}

#[async_trait]
impl SignalingChannel for MemorySignaling {
    async fn register(
        &self,
        local: &PeerId,
    ) -> Result<mpsc::UnboundedReceiver<SignalingEvent>, SignalingError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.hub.peers.lock().insert(local.clone(), tx);
        *self.local.lock() = Some(local.clone());
        self.hub
            .broadcast_except(local, SignalingEvent::PeerJoined(local.clone()));
        Ok(rx)
    }

    async fn send(&self, mut envelope: SignalEnvelope) -> Result<(), SignalingError> {
        let local = self
            .local
            .lock()
            .clone()
            .ok_or(SignalingError::NotRegistered)?;
        envelope.from = local;
        let to = envelope.to.clone();
        let signal = envelope.validate()?;

        let target = self.hub.peers.lock().get(&to).cloned();
        match target {
            Some(events) => {
                let _ = events.send(SignalingEvent::Signal(signal));
            }
            None => debug!("Signal for unknown peer {} dropped", to),
        }
        Ok(())
    }

    async fn close(&self) {
        let local = self.local.lock().take();
        if let Some(local) = local {
            self.hub.disconnect(&local);
        }
    }
}
