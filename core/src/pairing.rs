//! Manual pairing: direct links negotiated without any server
//!
//! The host shows an offer payload, the guest answers with its own payload,
//! and the two devices carry them across by QR code or copy/paste. A payload
//! is the base64 of the JSON negotiation object `{"type": ..., "sdp": ...}`.

use crate::identity::PeerId;
use crate::transport::{PeerLink, Role, SdpKind, SessionDescription, TransportError, TransportEvent, TransportManager, TransportState};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PairingError {
    #[error("Malformed pairing payload: {0}")]
    MalformedPayload(String),
    #[error("Unexpected payload: expected {expected:?}, got {actual:?}")]
    UnexpectedPayload { expected: SdpKind, actual: SdpKind },
    #[error("Pairing already completed this step")]
    WrongStage,
    #[error("Pairing did not connect within {0:?}")]
    Timeout(Duration),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingRole {
    Host,
    Guest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// Host waiting for the answer, guest waiting for the offer
    AwaitingInbound,
    Completed,
}

/// One side of a manual pairing handshake
pub struct ManualPairing {
    manager: TransportManager,
    role: PairingRole,
    peer_id: PeerId,
    link: Arc<dyn PeerLink>,
    outbound: Option<String>,
    stage: Stage,
}

impl ManualPairing {
    /// Start as host: create the initiator link and its offer payload
    pub async fn host(manager: &TransportManager) -> Result<Self, PairingError> {
        let peer_id = PeerId::manual();
        let link = manager.open_manual(&peer_id, Role::Initiator).await?;
        let offer = match link.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                manager.remove_peer(&peer_id).await;
                return Err(e.into());
            }
        };
        let outbound = encode_payload(&offer)?;
        info!("Manual pairing {} hosting", peer_id);
        Ok(Self {
            manager: manager.clone(),
            role: PairingRole::Host,
            peer_id,
            link,
            outbound: Some(outbound),
            stage: Stage::AwaitingInbound,
        })
    }

    /// Start as guest: create the responder link and wait for an offer
    pub async fn guest(manager: &TransportManager) -> Result<Self, PairingError> {
        let peer_id = PeerId::manual();
        let link = manager.open_manual(&peer_id, Role::Responder).await?;
        info!("Manual pairing {} joining", peer_id);
        Ok(Self {
            manager: manager.clone(),
            role: PairingRole::Guest,
            peer_id,
            link,
            outbound: None,
            stage: Stage::AwaitingInbound,
        })
    }

    pub fn role(&self) -> PairingRole {
        self.role
    }

    /// Temporary id the remote device is tracked under
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Payload to show the other device; `None` for a guest that has not
    /// received the offer yet
    pub fn outbound_payload(&self) -> Option<&str> {
        self.outbound.as_deref()
    }

    /// Feed the payload received from the other device. A malformed payload
    /// leaves the pairing untouched so the user can try again.
    pub async fn accept_inbound_payload(&mut self, payload: &str) -> Result<(), PairingError> {
        if self.stage != Stage::AwaitingInbound {
            return Err(PairingError::WrongStage);
        }
        let description = decode_payload(payload)?;
        let expected = match self.role {
            PairingRole::Host => SdpKind::Answer,
            PairingRole::Guest => SdpKind::Offer,
        };
        if description.kind != expected {
            return Err(PairingError::UnexpectedPayload {
                expected,
                actual: description.kind,
            });
        }

        match self.role {
            PairingRole::Host => {
                self.link.accept_answer(description).await?;
            }
            PairingRole::Guest => {
                let answer = self.link.accept_offer(description).await?;
                self.outbound = Some(encode_payload(&answer)?);
            }
        }
        self.stage = Stage::Completed;
        debug!("Manual pairing {} accepted inbound payload", self.peer_id);
        Ok(())
    }

    pub fn state(&self) -> TransportState {
        self.manager.state(&self.peer_id)
    }

    /// Wait until the link reports connected
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), PairingError> {
        let mut events = self.manager.subscribe();
        if self.state() == TransportState::Connected {
            return Ok(());
        }
        let wait = async {
            loop {
                match events.recv().await {
                    Ok(TransportEvent::Connected { peer_id }) if peer_id == self.peer_id => {
                        return Ok(())
                    }
                    Ok(TransportEvent::Disconnected { peer_id }) if peer_id == self.peer_id => {
                        return Err(PairingError::Transport(TransportError::ChannelNotReady(peer_id)))
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if self.state() == TransportState::Connected {
                            return Ok(());
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(PairingError::Transport(TransportError::ChannelNotReady(
                            self.peer_id.clone(),
                        )))
                    }
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| PairingError::Timeout(timeout))?
    }

    /// Abandon the pairing and drop its link
    pub async fn cancel(self) {
        self.manager.remove_peer(&self.peer_id).await;
    }
}

/// base64(JSON `{type, sdp}`)
pub fn encode_payload(description: &SessionDescription) -> Result<String, PairingError> {
    let json = serde_json::to_vec(description)
        .map_err(|e| PairingError::MalformedPayload(e.to_string()))?;
    Ok(BASE64.encode(json))
}

/// Inverse of [`encode_payload`]; whitespace from copy/paste is ignored
pub fn decode_payload(payload: &str) -> Result<SessionDescription, PairingError> {
    let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Err(PairingError::MalformedPayload("empty payload".into()));
    }
    let json = BASE64
        .decode(compact.as_bytes())
        .map_err(|e| PairingError::MalformedPayload(format!("not base64: {}", e)))?;
    let description: SessionDescription = serde_json::from_slice(&json)
        .map_err(|e| PairingError::MalformedPayload(format!("not a negotiation object: {}", e)))?;
    if description.sdp.is_empty() {
        return Err(PairingError::MalformedPayload("empty sdp".into()));
    }
    Ok(description)
}
