// Private inbox encryption: X25519 ECDH + XChaCha20-Poly1305
//
// Sender side:
// 1. Convert recipient's Ed25519 public key → X25519 public key
// 2. Generate ephemeral X25519 keypair
// 3. ECDH + Blake3 KDF → symmetric key
// 4. XChaCha20-Poly1305 with the sender public key bound as AAD
//
// Recipient converts its Ed25519 secret → X25519 and reverses the steps.
// On the relay the envelope travels as base64(bincode(envelope)).

use super::CryptoError;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use ed25519_dalek::SigningKey;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroize;

/// Changing this breaks every inbox entry already written.
const KDF_CONTEXT: &str = "eter-mesh v3 private inbox 2026-10-01";

/// Everything a recipient needs to open a private message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedEnvelope {
    pub sender_public_key: Vec<u8>,
    pub ephemeral_public_key: Vec<u8>,
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

impl SealedEnvelope {
    /// Relay representation: base64 of the bincode encoding
    pub fn to_wire(&self) -> Result<String, CryptoError> {
        let bytes = bincode::serialize(self).map_err(|_| CryptoError::EncryptionFailed)?;
        Ok(BASE64.encode(bytes))
    }

    pub fn from_wire(wire: &str) -> Result<Self, CryptoError> {
        let bytes = BASE64
            .decode(wire.trim())
            .map_err(|e| CryptoError::MalformedCiphertext(e.to_string()))?;
        bincode::deserialize(&bytes).map_err(|e| CryptoError::MalformedCiphertext(e.to_string()))
    }

    pub fn sender_public_key_hex(&self) -> String {
        hex::encode(&self.sender_public_key)
    }
}

/// Ed25519 and X25519 share Curve25519; the X25519 secret is the first half
/// of SHA-512(ed25519 secret), clamped by x25519-dalek.
fn ed25519_to_x25519_secret(signing_key: &SigningKey) -> StaticSecret {
    let mut hash = <sha2::Sha512 as sha2::Digest>::digest(signing_key.to_bytes());
    let mut secret_bytes = [0u8; 32];
    secret_bytes.copy_from_slice(&hash[..32]);

    let secret = StaticSecret::from(secret_bytes);

    secret_bytes.zeroize();
    hash.as_mut_slice().zeroize();

    secret
}

/// Birational map Edwards → Montgomery
fn ed25519_public_to_x25519(public_key_bytes: &[u8; 32]) -> Result<X25519PublicKey, CryptoError> {
    use curve25519_dalek::edwards::CompressedEdwardsY;

    let compressed = CompressedEdwardsY::from_slice(public_key_bytes)
        .map_err(|_| CryptoError::InvalidPublicKey)?;
    let edwards_point = compressed
        .decompress()
        .ok_or(CryptoError::InvalidPublicKey)?;

    Ok(X25519PublicKey::from(edwards_point.to_montgomery().to_bytes()))
}

/// Decode and validate a hex Ed25519 public key as exchanged between peers
pub fn parse_public_key_hex(public_key_hex: &str) -> Result<[u8; 32], CryptoError> {
    let bytes = hex::decode(public_key_hex.trim()).map_err(|_| CryptoError::InvalidPublicKey)?;
    let key: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidPublicKey)?;
    ed25519_public_to_x25519(&key)?;
    Ok(key)
}

/// Encrypt `plaintext` so that only the owner of `recipient_public_key` can read it
pub fn seal(
    sender_signing_key: &SigningKey,
    recipient_public_key: &[u8; 32],
    plaintext: &[u8],
) -> Result<SealedEnvelope, CryptoError> {
    let recipient_x25519 = ed25519_public_to_x25519(recipient_public_key)?;

    let ephemeral_secret = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
    let ephemeral_public = X25519PublicKey::from(&ephemeral_secret);
    let shared_secret = ephemeral_secret.diffie_hellman(&recipient_x25519);

    let mut symmetric_key = blake3::derive_key(KDF_CONTEXT, shared_secret.as_bytes());

    let mut nonce_bytes = [0u8; 24];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

    let sender_public_key = sender_signing_key.verifying_key().to_bytes();

    let cipher = XChaCha20Poly1305::new_from_slice(&symmetric_key)
        .map_err(|_| CryptoError::InvalidKeyMaterial)?;
    symmetric_key.zeroize();

    let ciphertext = cipher
        .encrypt(
            XNonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext,
                aad: &sender_public_key,
            },
        )
        .map_err(|_| CryptoError::EncryptionFailed)?;

    Ok(SealedEnvelope {
        sender_public_key: sender_public_key.to_vec(),
        ephemeral_public_key: ephemeral_public.to_bytes().to_vec(),
        nonce: nonce_bytes.to_vec(),
        ciphertext,
    })
}

/// Decrypt an envelope addressed to `recipient_signing_key`
pub fn open(
    recipient_signing_key: &SigningKey,
    envelope: &SealedEnvelope,
) -> Result<Vec<u8>, CryptoError> {
    let ephemeral_bytes: [u8; 32] = envelope
        .ephemeral_public_key
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::MalformedCiphertext("ephemeral key length".into()))?;
    if envelope.nonce.len() != 24 {
        return Err(CryptoError::MalformedCiphertext("nonce length".into()));
    }
    if envelope.sender_public_key.len() != 32 {
        return Err(CryptoError::MalformedCiphertext("sender key length".into()));
    }

    let recipient_secret = ed25519_to_x25519_secret(recipient_signing_key);
    let shared_secret = recipient_secret.diffie_hellman(&X25519PublicKey::from(ephemeral_bytes));

    let mut symmetric_key = blake3::derive_key(KDF_CONTEXT, shared_secret.as_bytes());
    let cipher = XChaCha20Poly1305::new_from_slice(&symmetric_key)
        .map_err(|_| CryptoError::InvalidKeyMaterial)?;
    symmetric_key.zeroize();

    cipher
        .decrypt(
            XNonce::from_slice(&envelope.nonce),
            Payload {
                msg: &envelope.ciphertext,
                aad: &envelope.sender_public_key,
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityKeys;

    #[test]
    fn test_seal_open_roundtrip() {
        let alice = IdentityKeys::generate();
        let bob = IdentityKeys::generate();

        let envelope = seal(&alice.signing_key, &bob.public_key_bytes(), b"hello bob").unwrap();
        assert_eq!(envelope.sender_public_key_hex(), alice.public_key_hex());

        let plaintext = open(&bob.signing_key, &envelope).unwrap();
        assert_eq!(plaintext, b"hello bob");
    }

    #[test]
    fn test_wrong_recipient_fails() {
        let alice = IdentityKeys::generate();
        let bob = IdentityKeys::generate();
        let eve = IdentityKeys::generate();

        let envelope = seal(&alice.signing_key, &bob.public_key_bytes(), b"secret").unwrap();
        assert_eq!(
            open(&eve.signing_key, &envelope),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn test_tampered_sender_fails() {
        let alice = IdentityKeys::generate();
        let bob = IdentityKeys::generate();
        let mallory = IdentityKeys::generate();

        let mut envelope = seal(&alice.signing_key, &bob.public_key_bytes(), b"secret").unwrap();
        envelope.sender_public_key = mallory.public_key_bytes().to_vec();
        assert_eq!(
            open(&bob.signing_key, &envelope),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn test_wire_roundtrip() {
        let alice = IdentityKeys::generate();
        let bob = IdentityKeys::generate();

        let envelope = seal(&alice.signing_key, &bob.public_key_bytes(), b"wire").unwrap();
        let wire = envelope.to_wire().unwrap();
        let decoded = SealedEnvelope::from_wire(&wire).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_garbage_wire_is_malformed() {
        assert!(matches!(
            SealedEnvelope::from_wire("%%% not base64"),
            Err(CryptoError::MalformedCiphertext(_))
        ));
        assert!(matches!(
            SealedEnvelope::from_wire(&BASE64.encode([1u8, 2, 3])),
            Err(CryptoError::MalformedCiphertext(_))
        ));
    }

    #[test]
    fn test_parse_public_key_hex() {
        let keys = IdentityKeys::generate();
        assert_eq!(
            parse_public_key_hex(&keys.public_key_hex()).unwrap(),
            keys.public_key_bytes()
        );
        assert_eq!(parse_public_key_hex("abcd"), Err(CryptoError::InvalidPublicKey));
        assert_eq!(parse_public_key_hex("zz"), Err(CryptoError::InvalidPublicKey));
    }

    #[test]
    fn test_truncated_envelope_rejected() {
        let alice = IdentityKeys::generate();
        let bob = IdentityKeys::generate();

        let mut envelope = seal(&alice.signing_key, &bob.public_key_bytes(), b"x").unwrap();
        envelope.nonce.truncate(12);
        assert!(matches!(
            open(&bob.signing_key, &envelope),
            Err(CryptoError::MalformedCiphertext(_))
        ));
    }
}
