//! # Pairwise Key Derivation
//!
//! The direct-message key: static-static ECDH between two identity keys,
//! stretched through HKDF.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       PAIRWISE KEY AGREEMENT                            │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   Alice                                              Bob               │
//! │   alice_priv × bob_pub ──┐               ┌── bob_priv × alice_pub      │
//! │                          ▼               ▼                              │
//! │                     same shared secret (ECDH)                          │
//! │                          │                                              │
//! │                HKDF-SHA256("vesper-pairwise-key-v1")                   │
//! │                          │                                              │
//! │                          ▼                                              │
//! │                  AES-256-GCM DM key                                    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The derived key is deterministic for a given pair of identity keys, so
//! it is recomputed per message and never persisted. There is no ratchet:
//! pairwise secrecy rests on the identity keys alone.

use p256::PublicKey;

use crate::crypto::{derive_pairwise_key, IdentityKeyPair, SymmetricKey};
use crate::directory::{require_peer_key, PublicKeyDirectory};
use crate::error::Result;

/// Derive the symmetric DM key between our keypair and a peer's public key
///
/// Commutative: both parties derive the same key.
pub fn derive_dm_key(mine: &IdentityKeyPair, peer_public: &PublicKey) -> Result<SymmetricKey> {
    let shared = mine.diffie_hellman(peer_public);
    derive_pairwise_key(&shared)
}

/// Derive the DM key for a peer known only by user id
///
/// Resolves the peer through the directory first; a peer who has never
/// published fails with `PeerKeyUnavailable`.
pub async fn derive_dm_key_for_user(
    mine: &IdentityKeyPair,
    directory: &dyn PublicKeyDirectory,
    peer_user_id: &str,
) -> Result<SymmetricKey> {
    let peer_jwk = require_peer_key(directory, peer_user_id).await?;
    let peer_public = crate::crypto::jwk_to_public_key(&peer_jwk)?;
    derive_dm_key(mine, &peer_public)
}

// ============================================================================
// TESTS
// ============================================================================
