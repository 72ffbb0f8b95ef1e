//! # Cryptography Module
//!
//! Cryptographic primitives used by Vesper Core.
//!
//! ## Security Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    CRYPTOGRAPHIC ARCHITECTURE                           │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Identity Keys (P-256, one ring per device)                            │
//! │  ──────────────────────────────────────────                             │
//! │  • ECDH key agreement, published as JWK to the blind directory         │
//! │  • Key id = SHA-256 of the uncompressed public point                   │
//! │                                                                         │
//! │  Pairwise Keys (ECDH + HKDF-SHA256)                                    │
//! │  ──────────────────────────────────                                     │
//! │  alice_priv × bob_pub  =  bob_priv × alice_pub  → shared secret        │
//! │  HKDF(shared, "vesper-pairwise-key-v1")         → AES-256 key          │
//! │  Recomputed on demand, never persisted.                                │
//! │                                                                         │
//! │  Content & Wrap Encryption (AES-256-GCM)                               │
//! │  ───────────────────────────────────────                                │
//! │  • 256-bit key, 96-bit random nonce, 128-bit tag                       │
//! │  • Used for message payloads, group-key wraps, and backups             │
//! │                                                                         │
//! │  Backup Keys (PBKDF2-HMAC-SHA256)                                      │
//! │  ────────────────────────────────                                       │
//! │  • ≥ 100 000 iterations, fresh random salt per seal                    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Algorithm Choices & Rationale
//!
//! | Algorithm | Purpose | Why Chosen |
//! |-----------|---------|------------|
//! | P-256 ECDH | Key agreement | Matches the JWK directory wire format |
//! | AES-256-GCM | Encryption | Hardware acceleration, AEAD |
//! | HKDF-SHA256 | Key derivation | Industry standard, well-analyzed |
//! | PBKDF2-SHA256 | Password KDF | Required shape of the backup bundle |

mod encryption;
mod kdf;
mod keys;

pub use encryption::{decrypt, encrypt, Nonce, SymmetricKey, KEY_SIZE, NONCE_SIZE};
pub use kdf::{derive_backup_key, derive_pairwise_key, BACKUP_MIN_ITERATIONS};
pub use keys::{jwk_to_public_key, key_id_for, public_key_to_jwk, IdentityKeyPair, Jwk};
