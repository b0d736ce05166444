//! Signaling wire types

use super::SignalingError;
use crate::identity::PeerId;
use crate::now_millis;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

/// Negotiation metadata addressed to one peer.
///
/// Wire shape: `{from, to, type, sdp?, candidate?, timestamp}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub from: PeerId,
    pub to: PeerId,
    #[serde(rename = "type")]
    pub kind: SignalKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<Value>,
    pub timestamp: u64,
}

impl SignalEnvelope {
    pub fn offer(from: PeerId, to: PeerId, sdp: impl Into<String>) -> Self {
        Self::new(from, to, SignalKind::Offer, Some(sdp.into()), None)
    }

    pub fn answer(from: PeerId, to: PeerId, sdp: impl Into<String>) -> Self {
        Self::new(from, to, SignalKind::Answer, Some(sdp.into()), None)
    }

    pub fn candidate(from: PeerId, to: PeerId, candidate: Value) -> Self {
        Self::new(from, to, SignalKind::Candidate, None, Some(candidate))
    }

    fn new(
        from: PeerId,
        to: PeerId,
        kind: SignalKind,
        sdp: Option<String>,
        candidate: Option<Value>,
    ) -> Self {
        Self {
            from,
            to,
            kind,
            sdp,
            candidate,
            timestamp: now_millis(),
        }
    }

    /// Check the envelope carries the payload its type demands
    pub fn validate(self) -> Result<Signal, SignalingError> {
        if self.from.as_str().is_empty() || self.to.as_str().is_empty() {
            return Err(SignalingError::MalformedEnvelope("missing peer id".into()));
        }
        match self.kind {
            SignalKind::Offer | SignalKind::Answer => {
                let sdp = self
                    .sdp
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| SignalingError::MalformedEnvelope("missing sdp".into()))?;
                Ok(if self.kind == SignalKind::Offer {
                    Signal::Offer { from: self.from, sdp }
                } else {
                    Signal::Answer { from: self.from, sdp }
                })
            }
            SignalKind::Candidate => {
                let candidate = self
                    .candidate
                    .filter(|c| !c.is_null())
                    .ok_or_else(|| SignalingError::MalformedEnvelope("missing candidate".into()))?;
                Ok(Signal::Candidate {
                    from: self.from,
                    candidate,
                })
            }
        }
    }
}

/// A validated inbound signal
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Offer { from: PeerId, sdp: String },
    Answer { from: PeerId, sdp: String },
    Candidate { from: PeerId, candidate: Value },
}

impl Signal {
    pub fn from_peer(&self) -> &PeerId {
        match self {
            Signal::Offer { from, .. } | Signal::Answer { from, .. } | Signal::Candidate { from, .. } => from,
        }
    }
}

/// Frames exchanged with the signaling server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SignalingFrame {
    Register { peer_id: PeerId },
    PeerJoined { peer_id: PeerId },
    PeerLeft { peer_id: PeerId },
    Signal { signal: SignalEnvelope },
}

impl SignalingFrame {
    pub fn to_text(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self).map_err(|e| SignalingError::Serialization(e.to_string()))
    }

    pub fn from_text(text: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(text).map_err(|e| SignalingError::MalformedEnvelope(e.to_string()))
    }
}

/// What a signaling channel reports to the transport manager
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    PeerJoined(PeerId),
    PeerLeft(PeerId),
    Signal(Signal),
    Disconnected,
}
