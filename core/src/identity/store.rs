// Identity storage in a single JSON file

use super::IdentityKeys;
use crate::crypto::CryptoError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use zeroize::Zeroizing;

const STORE_VERSION: u8 = 1;

#[derive(Debug, Error)]
pub enum IdentityStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Identity file is corrupt: {0}")]
    Corrupt(String),
    #[error("Unsupported identity file version {0}")]
    UnsupportedVersion(u8),
    #[error("Key error: {0}")]
    Key(#[from] CryptoError),
}

#[derive(Serialize, Deserialize)]
struct StoredIdentity {
    version: u8,
    secret_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nickname: Option<String>,
}

/// Where identity keys live between runs
pub enum IdentityStore {
    /// Nothing survives the process
    Memory,
    File(PathBuf),
}

impl IdentityStore {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn file(path: impl AsRef<Path>) -> Self {
        Self::File(path.as_ref().to_path_buf())
    }

    fn read(&self) -> Result<Option<StoredIdentity>, IdentityStoreError> {
        let Self::File(path) = self else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        let contents = Zeroizing::new(std::fs::read_to_string(path)?);
        let stored: StoredIdentity = serde_json::from_str(&contents)
            .map_err(|e| IdentityStoreError::Corrupt(e.to_string()))?;
        if stored.version != STORE_VERSION {
            return Err(IdentityStoreError::UnsupportedVersion(stored.version));
        }
        Ok(Some(stored))
    }

    fn write(&self, stored: &StoredIdentity) -> Result<(), IdentityStoreError> {
        let Self::File(path) = self else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = Zeroizing::new(
            serde_json::to_string_pretty(stored)
                .map_err(|e| IdentityStoreError::Corrupt(e.to_string()))?,
        );
        std::fs::write(path, json.as_bytes())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    /// Save keys, keeping any stored nickname
    pub fn save_keys(&self, keys: &IdentityKeys) -> Result<(), IdentityStoreError> {
        let nickname = self.read()?.and_then(|s| s.nickname);
        self.write(&StoredIdentity {
            version: STORE_VERSION,
            secret_key: keys.to_secret_hex().to_string(),
            nickname,
        })
    }

    pub fn save_nickname(&self, nickname: &str) -> Result<(), IdentityStoreError> {
        match self.read()? {
            Some(mut stored) => {
                stored.nickname = Some(nickname.to_string());
                self.write(&stored)
            }
            None => Err(IdentityStoreError::Corrupt(
                "no identity to attach a nickname to".into(),
            )),
        }
    }

    pub fn load_keys(&self) -> Result<Option<IdentityKeys>, IdentityStoreError> {
        match self.read()? {
            Some(stored) => Ok(Some(IdentityKeys::from_secret_hex(&stored.secret_key)?)),
            None => Ok(None),
        }
    }

    pub fn load_nickname(&self) -> Result<Option<String>, IdentityStoreError> {
        Ok(self.read()?.and_then(|s| s.nickname))
    }

    /// Load the stored identity or create and save a new one
    pub fn load_or_generate(&self) -> Result<IdentityKeys, IdentityStoreError> {
        if let Some(keys) = self.load_keys()? {
            return Ok(keys);
        }
        let keys = IdentityKeys::generate();
        self.save_keys(&keys)?;
        Ok(keys)
    }

    pub fn clear(&self) -> Result<(), IdentityStoreError> {
        if let Self::File(path) = self {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}
