//! Message shapes carried on channels

use crate::crypto::CryptoError;
use crate::relay::RelayError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Marker on public messages that travelled over a direct link
pub const DIRECT_SOURCE: &str = "p2p-mesh";

const MAX_TEXT_LEN: usize = 16 * 1024;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ChannelError {
    #[error("An identity is required for encrypted channels")]
    IdentityRequired,
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
    #[error("Invalid channel name: {0:?}")]
    InvalidChannel(String),
    #[error("Message not delivered on any path: {0}")]
    Undelivered(String),
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Public message: `{id, text, sender, alias, timestamp}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicMessage {
    pub id: String,
    pub text: String,
    /// Sender peer id
    pub sender: String,
    /// Display name
    pub alias: String,
    pub timestamp: u64,
}

impl PublicMessage {
    pub fn new(text: impl Into<String>, sender: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.into(),
            sender: sender.into(),
            alias: alias.into(),
            timestamp: crate::now_millis(),
        }
    }

    /// Boundary check for anything that came off the wire
    pub fn validate(&self) -> Result<(), ChannelError> {
        if self.id.is_empty() {
            return Err(ChannelError::InvalidMessage("missing id".into()));
        }
        if self.sender.is_empty() {
            return Err(ChannelError::InvalidMessage("missing sender".into()));
        }
        if self.text.len() > MAX_TEXT_LEN {
            return Err(ChannelError::InvalidMessage(format!(
                "text exceeds {} bytes",
                MAX_TEXT_LEN
            )));
        }
        Ok(())
    }
}

/// Public channel names are one graph segment: non-empty, no '/'
pub fn validate_channel_name(name: &str) -> Result<(), ChannelError> {
    if name.trim().is_empty() || name.contains('/') {
        return Err(ChannelError::InvalidChannel(name.to_string()));
    }
    Ok(())
}

/// A public message tagged for direct broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelFrame {
    #[serde(rename = "_channel")]
    pub channel: String,
    #[serde(rename = "_source")]
    pub source: String,
    #[serde(flatten)]
    pub message: PublicMessage,
}

impl ChannelFrame {
    pub fn direct(channel: impl Into<String>, message: PublicMessage) -> Self {
        Self {
            channel: channel.into(),
            source: DIRECT_SOURCE.to_string(),
            message,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ChannelError> {
        serde_json::to_vec(self).map_err(|e| ChannelError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ChannelError> {
        let frame: Self = serde_json::from_slice(bytes)
            .map_err(|e| ChannelError::InvalidMessage(e.to_string()))?;
        frame.message.validate()?;
        Ok(frame)
    }
}

/// Encrypted entry as stored in an inbox or session stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedMessage {
    pub ciphertext: String,
    pub sender_pub: String,
    pub timestamp: u64,
}

/// Plaintext inside a private inbox entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct PrivateBody {
    pub id: String,
    pub text: String,
    pub timestamp: u64,
}

/// A decrypted private message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateMessage {
    pub id: String,
    /// Sender public key (hex)
    pub from: String,
    pub text: String,
    pub timestamp: u64,
}

/// One entry of a synced session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub id: String,
    pub body: Value,
    pub timestamp: u64,
}
