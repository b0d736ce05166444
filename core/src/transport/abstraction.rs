//! Transport abstraction layer
//!
//! Connection states, events and errors shared by the manager and link backends.

use crate::identity::PeerId;
use crate::signaling::SignalingError;
use std::fmt;
use thiserror::Error;

/// Lifecycle of a direct connection to one remote peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    /// No connection object exists
    Idle,
    /// Offer/answer/candidates in flight
    Negotiating,
    /// Data channel open
    Connected,
    /// Torn down; the entry is gone from the live set
    Disconnected,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportState::Idle => write!(f, "idle"),
            TransportState::Negotiating => write!(f, "negotiating"),
            TransportState::Connected => write!(f, "connected"),
            TransportState::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Which side of the negotiation this node plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Initiator,
    Responder,
}

/// How the connection was negotiated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkKind {
    /// Through the signaling server
    Signaled,
    /// Through a visually exchanged payload
    Manual,
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkKind::Signaled => write!(f, "signaled"),
            LinkKind::Manual => write!(f, "manual"),
        }
    }
}

/// Read-only view of one connection, as handed to the peer registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConnection {
    pub peer_id: PeerId,
    pub state: TransportState,
    pub role: Role,
    pub kind: LinkKind,
}

/// Events from the transport manager. Each transition fires exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Negotiating → connected
    Connected { peer_id: PeerId },
    /// Any live state → disconnected
    Disconnected { peer_id: PeerId },
    DataReceived { peer_id: PeerId, data: Vec<u8> },
}

/// Errors that can occur in transport operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Channel not ready for peer {0}")]
    ChannelNotReady(PeerId),

    #[error("Connection already exists for peer {0}")]
    AlreadyConnected(PeerId),

    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    #[error("Link error: {0}")]
    Link(String),

    #[error("Send queue full for peer {0}")]
    QueueFull(PeerId),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Signaling not attached")]
    NoSignaling,
}
