//! Relay network
//!
//! A replicated key/value graph reachable through a list of relay endpoints.
//! Clients write presence pulses, channel messages, inbox entries and
//! session shares; relays fan writes out to every subscriber of a prefix.

pub mod bridge;
pub mod client;
pub mod endpoint;
pub mod graph;
pub mod protocol;
pub mod server;

pub use bridge::{RelayBridge, RelayBridgeConfig, RelayHealth};
pub use client::WsRelayEndpoint;
pub use endpoint::{GraphFeed, MemoryRelay, RelayEndpoint};
pub use graph::GraphStore;
pub use protocol::{PresencePulse, RelayFrame, ShareRecord};
pub use server::{RelayServer, RelayServerConfig, RelayServerHandle, RelayServerStats};

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("No relays configured")]
    NoRelaysConfigured,
    #[error("No relay reachable")]
    NoRelayReachable,
    #[error("Not connected to any relay")]
    NotConnected,
    #[error("Relay unreachable: {0}")]
    Unreachable(String),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
    #[error("Relay request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Relay rejected request: {0}")]
    Rejected(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Share not found: {0}")]
    NotFound(String),
    #[error("Corrupted session data: {0}")]
    Corrupted(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("I/O error: {0}")]
    Io(String),
}
