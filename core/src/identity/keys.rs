// Cryptographic identity: Ed25519 signing key, public half is the peer id

use super::PeerId;
use crate::crypto::CryptoError;
use ed25519_dalek::SigningKey;
use std::fmt;
use zeroize::{Zeroize, Zeroizing};

/// Long-lived identity of an authenticated peer
#[derive(Clone)]
pub struct IdentityKeys {
    pub signing_key: SigningKey,
}

impl IdentityKeys {
    /// Generate new identity keys
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut secret_key_bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut secret_key_bytes);
        let signing_key = SigningKey::from_bytes(&secret_key_bytes);
        secret_key_bytes.zeroize();
        Self { signing_key }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Hex-encoded public key, the canonical exchanged identity
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::new(self.public_key_hex())
    }

    /// Secret key bytes, wiped on drop
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.signing_key.to_bytes().to_vec())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let mut secret: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyMaterial)?;
        let signing_key = SigningKey::from_bytes(&secret);
        secret.zeroize();
        Ok(Self { signing_key })
    }

    pub fn to_secret_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.to_bytes().as_slice()))
    }

    pub fn from_secret_hex(secret_hex: &str) -> Result<Self, CryptoError> {
        let bytes = Zeroizing::new(
            hex::decode(secret_hex.trim()).map_err(|_| CryptoError::InvalidKeyMaterial)?,
        );
        Self::from_bytes(&bytes)
    }
}

impl fmt::Debug for IdentityKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeys")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}
