//! # Symmetric Encryption
//!
//! AES-256-GCM for message payloads, group-key wraps, and backups.
//!
//! Every ciphertext this crate produces pairs a fresh random 96-bit nonce
//! with a 256-bit key. Random nonces are safe for up to 2^32 messages per
//! key (birthday bound for 96-bit nonces), far beyond a conversation
//! epoch's lifetime.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce as AesNonce,
};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

/// Size of the AES-GCM nonce in bytes (96 bits)
pub const NONCE_SIZE: usize = 12;

/// Size of the encryption key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// A nonce (number used once) for AES-GCM encryption
///
/// Never reuse a nonce with the same key: reuse breaks both
/// confidentiality and authenticity of GCM.
#[derive(Clone, Copy, Debug)]
pub struct Nonce(pub [u8; NONCE_SIZE]);

impl Nonce {
    /// Generate a cryptographically random nonce
    pub fn random() -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create from existing bytes
    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}

/// A 256-bit symmetric key
///
/// Used for pairwise (DM) keys, group epoch keys, and backup keys.
/// Zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_SIZE]);

impl SymmetricKey {
    /// Generate a fresh random key (group epoch creation / rotation)
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from a slice, checking the length
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::InvalidKey(format!("key must be {} bytes", KEY_SIZE)))?;
        Ok(Self(bytes))
    }

    /// Get the raw key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

// Prevent accidental logging
impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SymmetricKey([REDACTED])")
    }
}

/// Encrypt a payload using AES-256-GCM with a fresh random nonce
///
/// Returns the nonce alongside the ciphertext (which includes the 16-byte
/// authentication tag).
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<(Nonce, Vec<u8>)> {
    let nonce = Nonce::random();
    let cipher = Aes256Gcm::new_from_slice(&key.0)
        .map_err(|e| Error::EncryptionFailed(format!("invalid key: {}", e)))?;

    let ciphertext = cipher
        .encrypt(AesNonce::from_slice(&nonce.0), plaintext)
        .map_err(|e| Error::EncryptionFailed(format!("AES-GCM encryption failed: {}", e)))?;

    Ok((nonce, ciphertext))
}

/// Decrypt a payload using AES-256-GCM
///
/// ## Errors
///
/// Returns `DecryptionFailed` on any authentication failure: tampered
/// ciphertext, wrong key, or wrong nonce. Never yields partial plaintext.
pub fn decrypt(key: &SymmetricKey, nonce: &Nonce, ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(&key.0)
        .map_err(|e| Error::DecryptionFailed(format!("invalid key: {}", e)))?;

    cipher
        .decrypt(AesNonce::from_slice(&nonce.0), ciphertext)
        .map_err(|_| Error::DecryptionFailed("authentication tag mismatch".into()))
}

// ============================================================================
// TESTS
// ============================================================================
