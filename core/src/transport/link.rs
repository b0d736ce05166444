//! Link backends: the thing that actually carries bytes between two peers

use super::abstraction::TransportError;
use crate::identity::PeerId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Negotiation object exchanged during offer/answer: `{type, sdp}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Asynchronous notifications from a link to its owning task
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Trickled ICE candidate to forward to the remote side
    LocalCandidate(Value),
    /// Data channel is open in both directions
    Open,
    Message(Vec<u8>),
    /// Remote close, failure, or local close; always the last event
    Closed,
}

/// Connectivity options for a new link
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LinkOptions {
    /// STUN/TURN urls; empty for air-gapped pairing
    pub ice_servers: Vec<String>,
    /// Forward candidates as they are gathered instead of embedding them
    pub trickle: bool,
}

impl LinkOptions {
    pub fn with_stun(ice_servers: Vec<String>) -> Self {
        Self {
            ice_servers,
            trickle: true,
        }
    }

    /// No STUN, all candidates inside the description
    pub fn air_gapped() -> Self {
        Self {
            ice_servers: Vec::new(),
            trickle: false,
        }
    }
}

/// Creates links; one factory per node
#[async_trait]
pub trait LinkFactory: Send + Sync {
    async fn create_link(
        &self,
        local: &PeerId,
        remote: &PeerId,
        options: &LinkOptions,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>, TransportError>;
}

/// One direct connection, driven through offer/answer by its owner
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Responder side: apply the remote offer and produce the answer
    async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription, TransportError>;

    async fn accept_answer(&self, answer: SessionDescription) -> Result<(), TransportError>;

    async fn add_candidate(&self, candidate: Value) -> Result<(), TransportError>;

    async fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    async fn close(&self);
}
