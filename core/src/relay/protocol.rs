//! Relay wire protocol: JSON frames over WebSocket, key layout, pulse shape

use super::RelayError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Root of the shared graph
pub const GRAPH_ROOT: &str = "eter-global-v3";

/// Prefix for connectivity self-test writes
pub const SELF_TEST_ROOT: &str = "eter-test-v1";

/// Presence pulse as stored under `eter-global-v3/pulse/<peerId>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresencePulse {
    pub timestamp: u64,
    pub status: String,
    pub platform: String,
}

impl PresencePulse {
    pub fn online(timestamp: u64, platform: impl Into<String>) -> Self {
        Self {
            timestamp,
            status: "online".to_string(),
            platform: platform.into(),
        }
    }
}

/// Out-of-band session share as stored under `eter-global-v3/shares/<shareId>`.
/// `data` is the JSON-serialized session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareRecord {
    pub data: String,
    pub timestamp: u64,
    pub author: String,
}

pub fn pulse_prefix() -> String {
    format!("{}/pulse/", GRAPH_ROOT)
}

pub fn pulse_key(peer_id: &str) -> String {
    format!("{}/pulse/{}", GRAPH_ROOT, peer_id)
}

pub fn share_key(share_id: &str) -> String {
    format!("{}/shares/{}", GRAPH_ROOT, share_id)
}

pub fn self_test_key(token: &str) -> String {
    format!("{}/{}", SELF_TEST_ROOT, token)
}

/// Graph path of a public chat channel
pub fn public_channel(name: &str) -> String {
    format!("{}/channels/{}", GRAPH_ROOT, name)
}

pub fn channel_prefix(channel: &str) -> String {
    format!("{}/", channel.trim_end_matches('/'))
}

pub fn inbox_prefix(recipient_pub: &str) -> String {
    format!("eter-users/{}/inbox/", recipient_pub)
}

pub fn session_prefix(author_pub: &str, session_id: &str) -> String {
    format!("eter-sessions/{}/{}/messages/", author_pub, session_id)
}

/// Last path segment of a graph key
pub fn key_leaf(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// One frame on a relay connection.
///
/// Requests carry a client-chosen `id` echoed by the matching response.
/// `state` on a write is the writer's wall clock in milliseconds and decides
/// last-write-wins conflicts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RelayFrame {
    Put {
        id: u64,
        key: String,
        value: Value,
        state: u64,
    },
    Get {
        id: u64,
        key: String,
    },
    /// Snapshot of every entry under a prefix
    List {
        id: u64,
        prefix: String,
    },
    /// Replay everything under `prefix`, then stream live updates tagged `sub = id`
    Sub {
        id: u64,
        prefix: String,
    },
    Ping {
        id: u64,
    },
    Ack {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        err: Option<String>,
    },
    Value {
        id: u64,
        key: String,
        #[serde(default)]
        value: Option<Value>,
    },
    Entries {
        id: u64,
        entries: Vec<(String, Value)>,
    },
    Update {
        sub: u64,
        key: String,
        value: Value,
    },
    Pong {
        id: u64,
    },
}

impl RelayFrame {
    pub fn to_text(&self) -> Result<String, RelayError> {
        serde_json::to_string(self).map_err(|e| RelayError::Protocol(e.to_string()))
    }

    pub fn from_text(text: &str) -> Result<Self, RelayError> {
        serde_json::from_str(text).map_err(|e| RelayError::Protocol(e.to_string()))
    }

    /// Correlation id of a response frame
    pub fn response_id(&self) -> Option<u64> {
        match self {
            RelayFrame::Ack { id, .. }
            | RelayFrame::Value { id, .. }
            | RelayFrame::Entries { id, .. }
            | RelayFrame::Pong { id } => Some(*id),
            _ => None,
        }
    }

    pub fn message_type(&self) -> &'static str {
        match self {
            RelayFrame::Put { .. } => "put",
            RelayFrame::Get { .. } => "get",
            RelayFrame::List { .. } => "list",
            RelayFrame::Sub { .. } => "sub",
            RelayFrame::Ping { .. } => "ping",
            RelayFrame::Ack { .. } => "ack",
            RelayFrame::Value { .. } => "value",
            RelayFrame::Entries { .. } => "entries",
            RelayFrame::Update { .. } => "update",
            RelayFrame::Pong { .. } => "pong",
        }
    }
}
