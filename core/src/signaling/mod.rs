//! Signaling: control-plane rendezvous used only to negotiate direct links

pub mod client;
pub mod memory;
pub mod server;
pub mod types;

pub use client::{SignalingChannel, WsSignalingClient};
pub use memory::{MemorySignaling, MemorySignalingHub};
pub use server::{SignalingServer, SignalingServerHandle};
pub use types::{Signal, SignalEnvelope, SignalKind, SignalingEvent, SignalingFrame};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("Not registered with the signaling server")]
    NotRegistered,
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Signaling connection closed")]
    Closed,
    #[error("Malformed signal: {0}")]
    MalformedEnvelope(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("I/O error: {0}")]
    Io(String),
}
