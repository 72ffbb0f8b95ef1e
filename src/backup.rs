//! # Password-Protected Key Backup
//!
//! Seals the whole key ring under a password-derived key so a user can
//! recover their identity on a new device. The relay stores only the
//! sealed bundle; without the password it holds nothing useful.
//!
//! ## Wire Shape
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         BACKUP BUNDLE                                   │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  {                                                                     │
//! │    "v": 1,                                                             │
//! │    "kdf": "PBKDF2",                                                    │
//! │    "hash": "SHA-256",                                                  │
//! │    "iterations": 100000,      // floor enforced on seal AND open       │
//! │    "salt": "<b64, >= 16 bytes>",                                       │
//! │    "iv": "<b64, 12-byte nonce>",                                       │
//! │    "ciphertext": "<b64, <= 256 KiB decoded>"                           │
//! │  }                                                                     │
//! │                                                                        │
//! │  plaintext inside: the serialized KeyRing (legacy bare keypair        │
//! │  payloads from old clients are accepted and upgraded on open)         │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The iteration count travels inside the bundle so `open` can reproduce
//! the key; a bundle claiming a count below the floor is rejected before
//! any derivation work, which also neuters downgrade-by-bundle attacks.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::crypto::{
    decrypt, derive_backup_key, encrypt, Nonce, BACKUP_MIN_ITERATIONS, NONCE_SIZE,
};
use crate::error::{Error, Result};
use crate::keyring::{KeyRing, ParsedRing};

/// Bundle format version this crate emits
pub const BACKUP_VERSION: u32 = 1;

/// Minimum salt length in bytes
pub const BACKUP_MIN_SALT_SIZE: usize = 16;

/// Maximum decoded ciphertext size accepted (matches the relay's cap)
pub const BACKUP_MAX_CIPHERTEXT: usize = 256 * 1024;

const BACKUP_KDF: &str = "PBKDF2";
const BACKUP_HASH: &str = "SHA-256";

/// A password-sealed key ring as stored on the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupBundle {
    /// Bundle format version
    pub v: u32,
    /// KDF identifier, always `"PBKDF2"`
    pub kdf: String,
    /// KDF hash identifier, always `"SHA-256"`
    pub hash: String,
    /// PBKDF2 iteration count used to seal this bundle
    pub iterations: u32,
    /// KDF salt, base64
    pub salt: String,
    /// AES-GCM nonce, base64
    pub iv: String,
    /// Sealed ring, base64
    pub ciphertext: String,
}

impl BackupBundle {
    /// Decode a downloaded payload into a validated bundle
    pub fn parse(raw: &serde_json::Value) -> Result<Self> {
        let bundle: Self = serde_json::from_value(raw.clone())
            .map_err(|e| Error::SerializationError(format!("backup bundle: {}", e)))?;
        bundle.validate()?;
        Ok(bundle)
    }

    /// Check the wire constraints the relay also enforces
    ///
    /// Run on every bundle before upload and before open, so a bundle this
    /// client produces is never one the relay would reject.
    pub fn validate(&self) -> Result<()> {
        if self.v != BACKUP_VERSION {
            return Err(Error::SerializationError(format!(
                "unsupported backup version: {}",
                self.v
            )));
        }
        if self.kdf != BACKUP_KDF || self.hash != BACKUP_HASH {
            return Err(Error::SerializationError(format!(
                "unsupported backup kdf: {}/{}",
                self.kdf, self.hash
            )));
        }
        if self.iterations < BACKUP_MIN_ITERATIONS {
            return Err(Error::SerializationError(format!(
                "backup iteration count {} below minimum {}",
                self.iterations, BACKUP_MIN_ITERATIONS
            )));
        }
        if self.decode_field("salt", &self.salt)?.len() < BACKUP_MIN_SALT_SIZE {
            return Err(Error::SerializationError(format!(
                "backup salt shorter than {} bytes",
                BACKUP_MIN_SALT_SIZE
            )));
        }
        if self.decode_field("iv", &self.iv)?.len() < NONCE_SIZE {
            return Err(Error::SerializationError(format!(
                "backup iv shorter than {} bytes",
                NONCE_SIZE
            )));
        }
        if self.decode_field("ciphertext", &self.ciphertext)?.len() > BACKUP_MAX_CIPHERTEXT {
            return Err(Error::SerializationError(format!(
                "backup ciphertext exceeds {} bytes",
                BACKUP_MAX_CIPHERTEXT
            )));
        }
        Ok(())
    }

    fn decode_field(&self, name: &str, value: &str) -> Result<Vec<u8>> {
        BASE64
            .decode(value)
            .map_err(|e| Error::SerializationError(format!("backup {}: {}", name, e)))
    }
}

/// Seal a key ring under a password
///
/// Fresh random salt and nonce per call: sealing the same ring twice
/// yields unrelated bundles.
pub fn seal(password: &str, ring: &KeyRing) -> Result<BackupBundle> {
    let mut salt = [0u8; BACKUP_MIN_SALT_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut salt);

    let key = derive_backup_key(password, &salt, BACKUP_MIN_ITERATIONS)?;
    let plaintext = serde_json::to_vec(ring)?;
    let (nonce, ciphertext) = encrypt(&key, &plaintext)?;

    if ciphertext.len() > BACKUP_MAX_CIPHERTEXT {
        return Err(Error::SerializationError(format!(
            "ring too large to back up: {} bytes sealed",
            ciphertext.len()
        )));
    }

    Ok(BackupBundle {
        v: BACKUP_VERSION,
        kdf: BACKUP_KDF.to_string(),
        hash: BACKUP_HASH.to_string(),
        iterations: BACKUP_MIN_ITERATIONS,
        salt: BASE64.encode(salt),
        iv: BASE64.encode(nonce.as_bytes()),
        ciphertext: BASE64.encode(ciphertext),
    })
}

/// Open a sealed bundle with a password
///
/// Fails closed: a wrong password is indistinguishable from tampering and
/// both surface as `DecryptionFailed` with no partial output. The inner
/// payload may be a legacy bare keypair from an old client; it is
/// upgraded to ring shape in memory.
pub fn open(password: &str, bundle: &BackupBundle) -> Result<ParsedRing> {
    bundle.validate()?;

    let salt = bundle.decode_field("salt", &bundle.salt)?;
    let iv = bundle.decode_field("iv", &bundle.iv)?;
    let ciphertext = bundle.decode_field("ciphertext", &bundle.ciphertext)?;

    let iv: [u8; NONCE_SIZE] = iv.try_into().map_err(|_| {
        Error::SerializationError(format!("backup iv must be {} bytes", NONCE_SIZE))
    })?;

    let key = derive_backup_key(password, &salt, bundle.iterations)?;
    let plaintext = decrypt(&key, &Nonce::from_bytes(iv), &ciphertext)?;

    let raw: serde_json::Value = serde_json::from_slice(&plaintext)?;
    KeyRing::parse(&raw)
}

// ============================================================================
// BACKUP TRANSPORT
// ============================================================================

/// Remote storage for sealed bundles
#[async_trait]
pub trait BackupTransport: Send + Sync {
    /// Download every bundle stored for a user, newest first where the
    /// relay can order them. Payloads are raw JSON; the caller parses and
    /// skips what it cannot open.
    async fn download_bundles(&self, user_id: &str) -> Result<Vec<serde_json::Value>>;

    /// Store a bundle for a user
    async fn upload_bundle(&self, user_id: &str, bundle: &BackupBundle) -> Result<()>;
}

/// Process-local backup storage for tests
#[derive(Default)]
pub struct InMemoryBackupTransport {
    bundles: RwLock<HashMap<String, Vec<serde_json::Value>>>,
}

impl InMemoryBackupTransport {
    /// Create an empty transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a raw payload (tests exercise malformed bundles)
    pub fn seed(&self, user_id: &str, raw: serde_json::Value) {
        self.bundles
            .write()
            .entry(user_id.to_string())
            .or_default()
            .push(raw);
    }

    /// Number of bundles stored for a user
    pub fn bundle_count(&self, user_id: &str) -> usize {
        self.bundles
            .read()
            .get(user_id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl BackupTransport for InMemoryBackupTransport {
    async fn download_bundles(&self, user_id: &str) -> Result<Vec<serde_json::Value>> {
        Ok(self
            .bundles
            .read()
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn upload_bundle(&self, user_id: &str, bundle: &BackupBundle) -> Result<()> {
        self.bundles
            .write()
            .entry(user_id.to_string())
            .or_default()
            .push(serde_json::to_value(bundle)?);
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::IdentityKeyPair;

    #[test]
    fn test_seal_open_round_trip() {
        let ring = KeyRing::new(&IdentityKeyPair::generate());

        let bundle = seal("correct horse", &ring).unwrap();
        let opened = open("correct horse", &bundle).unwrap();

        assert!(!opened.upgraded_from_legacy);
        assert_eq!(opened.ring, ring);
    }

    #[test]
    fn test_wrong_password_fails_closed() {
        let ring = KeyRing::new(&IdentityKeyPair::generate());
        let bundle = seal("correct horse", &ring).unwrap();

        assert!(matches!(
            open("battery staple", &bundle),
            Err(Error::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_sealing_twice_differs() {
        let ring = KeyRing::new(&IdentityKeyPair::generate());

        let b1 = seal("pw", &ring).unwrap();
        let b2 = seal("pw", &ring).unwrap();

        assert_ne!(b1.salt, b2.salt);
        assert_ne!(b1.ciphertext, b2.ciphertext);
    }

    #[test]
    fn test_rejects_weak_iteration_claim() {
        let ring = KeyRing::new(&IdentityKeyPair::generate());
        let mut bundle = seal("pw", &ring).unwrap();
        bundle.iterations = 1_000;

        assert!(matches!(
            open("pw", &bundle),
            Err(Error::SerializationError(_))
        ));
    }

    #[test]
    fn test_rejects_short_salt() {
        let ring = KeyRing::new(&IdentityKeyPair::generate());
        let mut bundle = seal("pw", &ring).unwrap();
        bundle.salt = BASE64.encode([0u8; 8]);

        assert!(bundle.validate().is_err());
    }

    #[test]
    fn test_rejects_oversized_ciphertext() {
        let ring = KeyRing::new(&IdentityKeyPair::generate());
        let mut bundle = seal("pw", &ring).unwrap();
        bundle.ciphertext = BASE64.encode(vec![0u8; BACKUP_MAX_CIPHERTEXT + 1]);

        assert!(bundle.validate().is_err());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(BackupBundle::parse(&serde_json::json!({ "v": 9 })).is_err());
        assert!(BackupBundle::parse(&serde_json::json!("nope")).is_err());
    }

    #[test]
    fn test_open_upgrades_legacy_inner_payload() {
        // A bundle sealed by an old client: bare keypair inside
        let kp = IdentityKeyPair::generate();
        let legacy = serde_json::json!({
            "publicKey": kp.public_jwk(),
            "privateKey": kp.private_jwk(),
        });

        let mut salt = [0u8; BACKUP_MIN_SALT_SIZE];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut salt);
        let key = derive_backup_key("pw", &salt, BACKUP_MIN_ITERATIONS).unwrap();
        let (nonce, ciphertext) =
            encrypt(&key, &serde_json::to_vec(&legacy).unwrap()).unwrap();
        let bundle = BackupBundle {
            v: BACKUP_VERSION,
            kdf: BACKUP_KDF.into(),
            hash: BACKUP_HASH.into(),
            iterations: BACKUP_MIN_ITERATIONS,
            salt: BASE64.encode(salt),
            iv: BASE64.encode(nonce.as_bytes()),
            ciphertext: BASE64.encode(ciphertext),
        };

        let opened = open("pw", &bundle).unwrap();
        assert!(opened.upgraded_from_legacy);
        assert_eq!(opened.ring.current_key_id, kp.key_id());
    }

    #[tokio::test]
    async fn test_in_memory_transport_round_trip() {
        let transport = InMemoryBackupTransport::new();
        let ring = KeyRing::new(&IdentityKeyPair::generate());
        let bundle = seal("pw", &ring).unwrap();

        transport.upload_bundle("alice", &bundle).await.unwrap();
        let downloaded = transport.download_bundles("alice").await.unwrap();

        assert_eq!(downloaded.len(), 1);
        assert_eq!(BackupBundle::parse(&downloaded[0]).unwrap(), bundle);
    }
}
