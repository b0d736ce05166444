//! Mesh configuration: relay endpoints, signaling, STUN, timing and delivery policy

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Default public STUN servers used for direct transport
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun3.l.google.com:19302",
    "stun:stun4.l.google.com:19302",
    "stun:global.stun.twilio.com:3478",
];

/// A pulse or direct sighting older than this never counts as live
pub const STALENESS_WINDOW: Duration = Duration::from_secs(15);

/// Registry tick and presence emission period
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Default bound for the relay round-trip self-test
pub const SELF_TEST_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid relay url: {0}")]
    InvalidRelayUrl(String),
    #[error("Invalid signaling url: {0}")]
    InvalidSignalingUrl(String),
    #[error("Heartbeat interval must be shorter than the staleness window")]
    HeartbeatTooSlow,
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// How public messages are fanned out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPolicy {
    /// Broadcast on direct links and always publish to the relay as well
    #[default]
    DirectAndRelay,
    /// Publish to the relay only when no direct peer accepted the message
    DirectPreferred,
    /// Never use direct links for public traffic
    RelayOnly,
}

impl DeliveryPolicy {
    pub fn uses_direct(&self) -> bool {
        !matches!(self, DeliveryPolicy::RelayOnly)
    }

    pub fn needs_relay(&self, direct_sends: usize) -> bool {
        match self {
            DeliveryPolicy::DirectAndRelay | DeliveryPolicy::RelayOnly => true,
            DeliveryPolicy::DirectPreferred => direct_sends == 0,
        }
    }
}

impl std::str::FromStr for DeliveryPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct_and_relay" | "both" => Ok(DeliveryPolicy::DirectAndRelay),
            "direct_preferred" | "direct" => Ok(DeliveryPolicy::DirectPreferred),
            "relay_only" | "relay" => Ok(DeliveryPolicy::RelayOnly),
            other => Err(ConfigError::InvalidValue {
                field: "delivery_policy",
                reason: format!("unknown policy '{}'", other),
            }),
        }
    }
}

/// Runtime configuration of one mesh node.
///
/// Durations are stored in milliseconds so the struct round-trips through
/// the CLI's JSON config file unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Relay endpoints (`ws://` or `wss://`)
    pub relays: Vec<String>,
    /// Rendezvous server for direct transport negotiation
    pub signaling_url: Option<String>,
    pub stun_servers: Vec<String>,
    /// Platform tag carried in presence pulses
    pub platform: String,
    pub staleness_window_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub self_test_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub delivery_policy: DeliveryPolicy,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            signaling_url: None,
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            platform: std::env::consts::OS.to_string(),
            staleness_window_ms: STALENESS_WINDOW.as_millis() as u64,
            heartbeat_interval_ms: HEARTBEAT_INTERVAL.as_millis() as u64,
            self_test_timeout_ms: SELF_TEST_TIMEOUT.as_millis() as u64,
            connect_timeout_ms: 5_000,
            request_timeout_ms: 5_000,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 60_000,
            delivery_policy: DeliveryPolicy::default(),
        }
    }
}

impl MeshConfig {
    pub fn with_relays<I, S>(mut self, relays: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.relays = relays.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_signaling(mut self, url: impl Into<String>) -> Self {
        self.signaling_url = Some(url.into());
        self
    }

    pub fn staleness_window(&self) -> Duration {
        Duration::from_millis(self.staleness_window_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn self_test_timeout(&self) -> Duration {
        Duration::from_millis(self.self_test_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for relay in &self.relays {
            if !is_ws_url(relay) {
                return Err(ConfigError::InvalidRelayUrl(relay.clone()));
            }
        }
        if let Some(url) = &self.signaling_url {
            if !is_ws_url(url) {
                return Err(ConfigError::InvalidSignalingUrl(url.clone()));
            }
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "heartbeat_interval_ms",
                reason: "must be positive".into(),
            });
        }
        if self.heartbeat_interval_ms >= self.staleness_window_ms {
            return Err(ConfigError::HeartbeatTooSlow);
        }
        if self.reconnect_base_ms == 0 || self.reconnect_base_ms > self.reconnect_max_ms {
            return Err(ConfigError::InvalidValue {
                field: "reconnect_base_ms",
                reason: "must be positive and not exceed reconnect_max_ms".into(),
            });
        }
        Ok(())
    }
}

fn is_ws_url(url: &str) -> bool {
    let rest = url
        .strip_prefix("ws://")
        .or_else(|| url.strip_prefix("wss://"));
    matches!(rest, Some(host) if !host.is_empty())
}

/// Exponential backoff: `base * 2^attempt`, capped at `max`
pub fn backoff_duration(base: Duration, max: Duration, attempt: u32) -> Duration {
    let base_ms = base.as_millis() as u64;
    let backoff_ms = base_ms.saturating_mul(2u64.pow(attempt.min(16)));
    Duration::from_millis(backoff_ms.min(max.as_millis() as u64))
}
