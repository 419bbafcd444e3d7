//! Symmetric payload encryption for ClipLink sessions
//!
//! A session's key is `SHA-256(session token)` and is fixed for the
//! session's lifetime. Payloads are sealed with AES-256-GCM under a fresh
//! random 96-bit nonce per call, laid out as `nonce || ciphertext || tag`.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

/// AES-GCM nonce length in bytes
pub const NONCE_LEN: usize = 12;

/// AES-GCM authentication tag length in bytes
pub const TAG_LEN: usize = 16;

/// Crypto errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Encryption failed (key setup or cipher failure)
    #[error("Encryption failed")]
    EncryptFailed,

    /// Authentication tag verification failed: wrong key, corrupted data,
    /// or truncated input
    #[error("Authentication tag mismatch")]
    AuthTagMismatch,
}

/// A derived 256-bit symmetric session key
#[derive(Clone)]
pub struct Key(Zeroizing<[u8; 32]>);

impl Key {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Key(..)")
    }
}

/// Stateless AEAD engine; operations are synchronous and CPU-bound
pub struct CryptoEngine;

impl CryptoEngine {
    /// Derive the session key as SHA-256 of the token value
    pub fn derive_key(token: &str) -> Key {
        let digest = Sha256::digest(token.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Key(Zeroizing::new(key))
    }

    /// Seal plaintext under a fresh random nonce
    ///
    /// Identical plaintext never produces identical output.
    pub fn encrypt(plaintext: &[u8], key: &Key) -> Result<Vec<u8>, CryptoError> {
        let cipher =
            Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::EncryptFailed)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::EncryptFailed)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Open `nonce || ciphertext || tag`, verifying the tag
    pub fn decrypt(sealed: &[u8], key: &Key) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::AuthTagMismatch);
        }
        let cipher =
            Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::EncryptFailed)?;
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::AuthTagMismatch)
    }

    /// Heuristic check for Base64-looking ciphertext
    ///
    /// Debugging and compatibility probing only; never a security decision.
    pub fn is_likely_encrypted(s: &str) -> bool {
        s.len() >= 24
            && s.bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'=')
    }
}
