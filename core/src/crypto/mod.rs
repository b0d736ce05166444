// Cryptography module: payload encryption for private inboxes and session sync

pub mod encrypt;
pub mod session;

pub use encrypt::{open, parse_public_key_hex, seal, SealedEnvelope};
pub use session::{decrypt_session, encrypt_session, SessionKey};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid public key")]
    InvalidPublicKey,

    #[error("Invalid key material")]
    InvalidKeyMaterial,

    #[error("Malformed ciphertext: {0}")]
    MalformedCiphertext(String),

    #[error("Encryption failed")]
    EncryptionFailed,

    /// Wrong key, corrupted ciphertext, or tampered sender binding
    #[error("Decryption failed")]
    DecryptionFailed,
}
