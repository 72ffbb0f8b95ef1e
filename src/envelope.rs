//! # Encrypted Message Envelope
//!
//! The payload shape every encrypted message travels in, direct or group.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      ENCRYPTED ENVELOPE                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  {                                                                     │
//! │    "e2ee": true,                                                       │
//! │    "version": 1,                                                       │
//! │    "algo": "AES-GCM",                                                  │
//! │    "keyVersion": 2,          // group only; absent on DMs              │
//! │    "iv": "<b64 nonce>",                                                │
//! │    "ciphertext": "<b64 ciphertext + tag>"                              │
//! │  }                                                                     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `keyVersion` is what lets a recipient decrypt a message sent under an
//! earlier epoch without guessing, and detect that its cached key is
//! behind the sender's.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

use crate::crypto::{decrypt, encrypt, Nonce, SymmetricKey, NONCE_SIZE};
use crate::error::{Error, Result};

/// Envelope format version this crate emits
pub const ENVELOPE_VERSION: u32 = 1;

const ENVELOPE_ALGO: &str = "AES-GCM";

/// An encrypted message payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedEnvelope {
    /// Always `true`; lets plaintext and encrypted payloads coexist on the
    /// same message field during rollout
    pub e2ee: bool,
    /// Envelope format version
    pub version: u32,
    /// AEAD algorithm identifier
    pub algo: String,
    /// Group key epoch the ciphertext was sealed under; absent on DMs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_version: Option<u32>,
    /// AES-GCM nonce, base64
    pub iv: String,
    /// Ciphertext plus tag, base64
    pub ciphertext: String,
}

impl EncryptedEnvelope {
    /// Encrypt a plaintext into an envelope
    pub fn seal(key: &SymmetricKey, plaintext: &[u8], key_version: Option<u32>) -> Result<Self> {
        let (nonce, ciphertext) = encrypt(key, plaintext)?;
        Ok(Self {
            e2ee: true,
            version: ENVELOPE_VERSION,
            algo: ENVELOPE_ALGO.to_string(),
            key_version,
            iv: BASE64.encode(nonce.as_bytes()),
            ciphertext: BASE64.encode(ciphertext),
        })
    }

    /// Decrypt the envelope with the given key
    ///
    /// Shape problems (unknown algorithm, bad base64) are distinguished
    /// from authentication failure so callers only run stale-key recovery
    /// when recovery can actually help.
    pub fn open(&self, key: &SymmetricKey) -> Result<Vec<u8>> {
        self.check_shape()?;
        let nonce = self.nonce()?;
        let ciphertext = BASE64
            .decode(&self.ciphertext)
            .map_err(|e| Error::SerializationError(format!("envelope ciphertext: {}", e)))?;
        decrypt(key, &nonce, &ciphertext)
    }

    fn check_shape(&self) -> Result<()> {
        if !self.e2ee {
            return Err(Error::SerializationError(
                "payload is not an encrypted envelope".into(),
            ));
        }
        if self.algo != ENVELOPE_ALGO {
            return Err(Error::SerializationError(format!(
                "unsupported envelope algo: {}",
                self.algo
            )));
        }
        Ok(())
    }

    fn nonce(&self) -> Result<Nonce> {
        let bytes = BASE64
            .decode(&self.iv)
            .map_err(|e| Error::SerializationError(format!("envelope iv: {}", e)))?;
        let bytes: [u8; NONCE_SIZE] = bytes.try_into().map_err(|_| {
            Error::SerializationError(format!("envelope iv must be {} bytes", NONCE_SIZE))
        })?;
        Ok(Nonce::from_bytes(bytes))
    }
}

// ============================================================================
// TESTS
// ============================================================================
