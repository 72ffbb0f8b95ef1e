//! # Key Derivation Functions
//!
//! Two derivations live here, one per long-lived secret:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       KEY DERIVATION PATHS                              │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Pairwise (DM / key wrap)                                              │
//! │  ────────────────────────                                               │
//! │  ECDH shared secret ──► HKDF-SHA256(info = "vesper-pairwise-key-v1")   │
//! │                     ──► 32-byte AES-256-GCM key                        │
//! │                                                                         │
//! │  Backup (password)                                                     │
//! │  ─────────────────                                                      │
//! │  password ──► PBKDF2-HMAC-SHA256(salt, iterations ≥ 100 000)           │
//! │           ──► 32-byte AES-256-GCM key                                  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The `-v1` suffix in the domain string allows future algorithm upgrades
//! without ambiguity about which derivation produced a key.

use hkdf::Hkdf;
use sha2::Sha256;

use crate::crypto::encryption::{SymmetricKey, KEY_SIZE};
use crate::error::{Error, Result};

/// Domain separation string for pairwise key derivation
const PAIRWISE_KEY_DOMAIN: &[u8] = b"vesper-pairwise-key-v1";

/// Minimum PBKDF2 iteration count the backup wire contract allows
pub const BACKUP_MIN_ITERATIONS: u32 = 100_000;

/// Derive the pairwise symmetric key from an ECDH shared secret
///
/// Deterministic: both parties of the agreement derive the same key, and
/// the same pair of identity keys always yields the same result. The
/// output is used directly for DM payloads and for wrapping group keys;
/// it is recomputed on demand and never persisted.
pub fn derive_pairwise_key(shared_secret: &[u8; 32]) -> Result<SymmetricKey> {
    let hkdf = Hkdf::<Sha256>::new(None, shared_secret);

    let mut key = [0u8; KEY_SIZE];
    hkdf.expand(PAIRWISE_KEY_DOMAIN, &mut key)
        .map_err(|_| Error::KeyDerivationFailed("HKDF expansion failed".into()))?;

    Ok(SymmetricKey::from_bytes(key))
}

/// Derive a backup encryption key from a password
///
/// PBKDF2-HMAC-SHA256. The iteration count travels inside the backup
/// bundle so `open` can reproduce the key; counts below
/// [`BACKUP_MIN_ITERATIONS`] are rejected before any work is done.
pub fn derive_backup_key(password: &str, salt: &[u8], iterations: u32) -> Result<SymmetricKey> {
    if iterations < BACKUP_MIN_ITERATIONS {
        return Err(Error::KeyDerivationFailed(format!(
            "PBKDF2 iteration count {} below minimum {}",
            iterations, BACKUP_MIN_ITERATIONS
        )));
    }

    let mut key = [0u8; KEY_SIZE];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut key);

    Ok(SymmetricKey::from_bytes(key))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairwise_key_deterministic() {
        let shared = [42u8; 32];

        let k1 = derive_pairwise_key(&shared).unwrap();
        let k2 = derive_pairwise_key(&shared).unwrap();

        assert_eq!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn test_pairwise_key_differs_per_secret() {
        let k1 = derive_pairwise_key(&[1u8; 32]).unwrap();
        let k2 = derive_pairwise_key(&[2u8; 32]).unwrap();

        assert_ne!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn test_backup_key_deterministic() {
        let salt = [7u8; 16];

        let k1 = derive_backup_key("hunter2", &salt, BACKUP_MIN_ITERATIONS).unwrap();
        let k2 = derive_backup_key("hunter2", &salt, BACKUP_MIN_ITERATIONS).unwrap();

        assert_eq!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn test_backup_key_salt_and_password_matter() {
        let base = derive_backup_key("hunter2", &[7u8; 16], BACKUP_MIN_ITERATIONS).unwrap();
        let other_salt = derive_backup_key("hunter2", &[8u8; 16], BACKUP_MIN_ITERATIONS).unwrap();
        let other_pass = derive_backup_key("hunter3", &[7u8; 16], BACKUP_MIN_ITERATIONS).unwrap();

        assert_ne!(base.as_bytes(), other_salt.as_bytes());
        assert_ne!(base.as_bytes(), other_pass.as_bytes());
    }

    #[test]
    fn test_backup_key_rejects_weak_iteration_count() {
        let result = derive_backup_key("hunter2", &[7u8; 16], BACKUP_MIN_ITERATIONS - 1);
        assert!(matches!(result, Err(Error::KeyDerivationFailed(_))));
    }
}
