// Session-scoped symmetric encryption
//
// The author of a session encrypts each entry to itself: the key is derived
// from the identity secret and the session id, so only the same identity can
// read its session back from the relay.

use super::CryptoError;
use crate::identity::IdentityKeys;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use zeroize::Zeroizing;

const SESSION_KDF_CONTEXT: &str = "eter-mesh v3 session sync 2026-10-01";
const NONCE_LEN: usize = 24;

/// Symmetric key for one session, wiped on drop
#[derive(Clone)]
pub struct SessionKey(Zeroizing<[u8; 32]>);

impl SessionKey {
    pub fn derive(identity: &IdentityKeys, session_id: &str) -> Self {
        let secret = identity.to_bytes();
        let mut hasher = blake3::Hasher::new_derive_key(SESSION_KDF_CONTEXT);
        hasher.update(secret.as_slice());
        hasher.update(session_id.as_bytes());
        Self(Zeroizing::new(*hasher.finalize().as_bytes()))
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    fn cipher(&self) -> Result<XChaCha20Poly1305, CryptoError> {
        XChaCha20Poly1305::new_from_slice(self.0.as_slice()).map_err(|_| CryptoError::InvalidKeyMaterial)
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Encrypt to `base64(nonce || ciphertext)`
pub fn encrypt_session(key: &SessionKey, plaintext: &[u8]) -> Result<String, CryptoError> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let ciphertext = key
        .cipher()?
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(out))
}

pub fn decrypt_session(key: &SessionKey, ciphertext: &str) -> Result<Vec<u8>, CryptoError> {
    let bytes = BASE64
        .decode(ciphertext.trim())
        .map_err(|e| CryptoError::MalformedCiphertext(e.to_string()))?;
    if bytes.len() <= NONCE_LEN {
        return Err(CryptoError::MalformedCiphertext("too short".into()));
    }
    let (nonce, body) = bytes.split_at(NONCE_LEN);

    key.cipher()?
        .decrypt(XNonce::from_slice(nonce), body)
        .map_err(|_| CryptoError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_roundtrip() {
        let identity = IdentityKeys::generate();
        let key = SessionKey::derive(&identity, "session-1");

        let ciphertext = encrypt_session(&key, b"{\"role\":\"user\"}").unwrap();
        assert_eq!(
            decrypt_session(&key, &ciphertext).unwrap(),
            b"{\"role\":\"user\"}"
        );
    }

    #[test]
    fn test_key_depends_on_session_and_identity() {
        let identity = IdentityKeys::generate();
        let other = IdentityKeys::generate();

        let ciphertext =
            encrypt_session(&SessionKey::derive(&identity, "a"), b"payload").unwrap();

        assert_eq!(
            decrypt_session(&SessionKey::derive(&identity, "b"), &ciphertext),
            Err(CryptoError::DecryptionFailed)
        );
        assert_eq!(
            decrypt_session(&SessionKey::derive(&other, "a"), &ciphertext),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let identity = IdentityKeys::generate();
        let ciphertext =
            encrypt_session(&SessionKey::derive(&identity, "s"), b"again").unwrap();
        let rederived = SessionKey::derive(&identity, "s");
        assert_eq!(decrypt_session(&rederived, &ciphertext).unwrap(), b"again");
    }

    #[test]
    fn test_short_input_is_malformed() {
        let key = SessionKey::from_bytes([7u8; 32]);
        assert!(matches!(
            decrypt_session(&key, &BASE64.encode([0u8; 10])),
            Err(CryptoError::MalformedCiphertext(_))
        ));
        assert!(matches!(
            decrypt_session(&key, "***"),
            Err(CryptoError::MalformedCiphertext(_))
        ));
    }

    #[test]
    fn test_nonces_are_fresh() {
        let key = SessionKey::from_bytes([1u8; 32]);
        let a = encrypt_session(&key, b"same").unwrap();
        let b = encrypt_session(&key, b"same").unwrap();
        assert_ne!(a, b);
    }
}
