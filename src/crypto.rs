//! Context secret encryption using AES-256-GCM
//!
//! Generator templates may flag context variables as encrypted. The control
//! plane encrypts those values with a key derived from the generator's
//! per-instance collector token and the heartbeat timestamp; the collector
//! derives the same key to decrypt them. The variable name is bound as
//! additional authenticated data (AAD) so a ciphertext cannot be moved to a
//! different variable.
//!
//! Wire format (base64 encoded): `0x01 | nonce(12) | ciphertext + tag(16)`.

#![allow(deprecated)]

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

const VERSION_ENCRYPTED: u8 = 0x01;
const VERSION_FIELD_LEN: usize = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const MIN_ENCRYPTED_LEN: usize = VERSION_FIELD_LEN + NONCE_LEN + TAG_LEN;

/// Crypto error types
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("invalid ciphertext format")]
    InvalidFormat,
    #[error("empty ciphertext")]
    EmptyCiphertext,
    #[error("ciphertext is not valid base64: {0}")]
    InvalidEncoding(String),
}

/// Secure wrapper for encryption keys with zeroization
#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub struct ZeroizingKey(Vec<u8>);

/// Type alias for crypto keys
pub type CryptoKey = ZeroizingKey;

impl CryptoKey {
    /// Get the key as bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Derive the context secret shared with the control plane for one heartbeat.
pub fn derive_context_key(token: &str, timestamp: &str) -> CryptoKey {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.update(timestamp.as_bytes());
    ZeroizingKey(hasher.finalize().to_vec())
}

/// Encrypt bytes using AES-256-GCM
pub fn encrypt_bytes(
    key: &CryptoKey,
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let mut ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut result = Vec::with_capacity(VERSION_FIELD_LEN + NONCE_LEN + ciphertext.len());
    result.push(VERSION_ENCRYPTED);
    result.extend_from_slice(&nonce);
    result.append(&mut ciphertext);

    Ok(result)
}

/// Decrypt bytes using AES-256-GCM
pub fn decrypt_bytes(
    key: &CryptoKey,
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.is_empty() {
        return Err(CryptoError::EmptyCiphertext);
    }
    if !is_encrypted_payload(ciphertext) {
        return Err(CryptoError::InvalidFormat);
    }

    let nonce = Nonce::from_slice(&ciphertext[VERSION_FIELD_LEN..VERSION_FIELD_LEN + NONCE_LEN]);
    let tag_and_ct = &ciphertext[VERSION_FIELD_LEN + NONCE_LEN..];

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    cipher
        .decrypt(
            nonce,
            Payload {
                msg: tag_and_ct,
                aad,
            },
        )
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
}

/// Determine if a payload is using the encrypted format
pub fn is_encrypted_payload(ciphertext: &[u8]) -> bool {
    ciphertext.len() >= MIN_ENCRYPTED_LEN && ciphertext[0] == VERSION_ENCRYPTED
}

/// Encrypt a context variable value, returning the base64 wire form.
pub fn encrypt_context_value(
    key: &CryptoKey,
    variable: &str,
    plaintext: &str,
) -> Result<String, CryptoError> {
    let encrypted = encrypt_bytes(key, variable.as_bytes(), plaintext.as_bytes())?;
    Ok(BASE64.encode(encrypted))
}

/// Decrypt a base64 context variable value produced by the control plane.
pub fn decrypt_context_value(
    key: &CryptoKey,
    variable: &str,
    encoded: &str,
) -> Result<String, CryptoError> {
    let raw = BASE64
        .decode(encoded.trim())
        .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
    let bytes = decrypt_bytes(key, variable.as_bytes(), &raw)?;
    String::from_utf8(bytes).map_err(|e| CryptoError::DecryptionFailed(format!("Invalid UTF-8: {}", e)))
}
