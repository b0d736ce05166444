// Identity: who this node is on the mesh

pub mod keys;
pub mod store;

pub use keys::IdentityKeys;
pub use store::{IdentityStore, IdentityStoreError};

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque peer identifier.
///
/// Either the hex Ed25519 public key of an authenticated node, or a random
/// session token (`anon-xxxxxxxxx`) for anonymous nodes. It is stable for the
/// lifetime of a process and is the only dedup key used by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Random session token for a node without identity keys
    pub fn anonymous() -> Self {
        Self(format!("anon-{}", random_token(9)))
    }

    /// Temporary id for a manually paired connection
    pub fn manual() -> Self {
        Self(format!("manual-{}", random_token(5)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_anonymous(&self) -> bool {
        self.0.starts_with("anon-")
    }

    pub fn is_manual(&self) -> bool {
        self.0.starts_with("manual-")
    }

    /// Short form for log lines
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(12)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Lowercase base36 token of `len` characters
pub fn random_token(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| char::from_digit(rng.gen_range(0..36), 36).unwrap_or('0'))
        .collect()
}
