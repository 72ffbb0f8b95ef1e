//! # Vesper Core
//!
//! The key lifecycle subsystem of an end-to-end encrypted group
//! messenger: identity key rings, pairwise DM keys, epoch-versioned
//! group keys, multi-source reconciliation, and password-protected
//! backups.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        VESPER CORE MODULES                              │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌──────────────┐   │
//! │  │   Keyring   │  │  Pairwise   │  │    Group    │  │    Backup    │   │
//! │  │             │  │             │  │             │  │              │   │
//! │  │ - Ring      │  │ - ECDH      │  │ - Epochs    │  │ - Seal/Open  │   │
//! │  │ - Store     │  │ - HKDF      │  │ - Wraps     │  │ - PBKDF2     │   │
//! │  │ - Reconcile │  │ - DM keys   │  │ - Rotation  │  │ - Transport  │   │
//! │  └──────┬──────┘  └──────┬──────┘  └──────┬──────┘  └──────┬───────┘   │
//! │         │                │                │                │           │
//! │         └────────────────┴───────┬────────┴────────────────┘           │
//! │                                  │                                     │
//! │  ┌─────────────┐  ┌─────────────┐ ┌─────────────────────────────────┐  │
//! │  │   Crypto    │  │  Directory  │ │           Facade                │  │
//! │  │             │  │             │ │                                 │  │
//! │  │ - P-256     │  │ - Publish   │ │ - bootstrap                     │  │
//! │  │ - AES-GCM   │  │ - Fetch     │ │ - encrypt/decrypt (DM, group)   │  │
//! │  │ - KDFs      │  │ - JWK wire  │ │ - rotate / add member / backup  │  │
//! │  └─────────────┘  └─────────────┘ └─────────────────────────────────┘  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Hierarchy
//!
//! - [`error`] - Error types for the entire library
//! - [`crypto`] - Cryptographic primitives (keys, encryption, KDFs)
//! - [`keyring`] - The identity key ring: model, storage, reconciliation
//! - [`directory`] - The blind public key directory
//! - [`pairwise`] - Pairwise (DM) key derivation
//! - [`group`] - Group key epochs: resolution, distribution, rotation
//! - [`backup`] - Password-sealed key ring backup
//! - [`envelope`] - The encrypted message payload shape
//! - [`facade`] - The single entry point the messaging layer uses
//!
//! ## Security Model
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          SECURITY LAYERS                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Direct messages (P-256 ECDH + HKDF + AES-256-GCM)                     │
//! │  ─────────────────────────────────────────────────                      │
//! │  Each DM payload is sealed under the pairwise key derived from         │
//! │  both parties' identity keys. The key is recomputed per message        │
//! │  and never persisted.                                                  │
//! │                                                                         │
//! │  Group messages (epoch keys, wrapped per member)                       │
//! │  ───────────────────────────────────────────────                        │
//! │  One symmetric key per conversation epoch. The key reaches each        │
//! │  member wrapped under the admin↔member pairwise key; the server        │
//! │  only ever stores wraps it cannot open. Removal rotates the epoch;     │
//! │  addition does not, so newcomers read history.                         │
//! │                                                                         │
//! │  Backups (PBKDF2-HMAC-SHA256 + AES-256-GCM)                            │
//! │  ──────────────────────────────────────────                             │
//! │  The whole ring travels sealed under a password-derived key. The       │
//! │  relay stores opaque bundles; a wrong password fails closed.           │
//! │                                                                         │
//! │  Out of scope: intra-epoch forward secrecy (no ratchet) and            │
//! │  out-of-band identity verification.                                    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

pub mod backup;
pub mod crypto;
pub mod directory;
pub mod envelope;
pub mod error;
pub mod facade;
pub mod group;
pub mod keyring;
pub mod pairwise;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use backup::{BackupBundle, BackupTransport};
pub use crypto::{IdentityKeyPair, Jwk, SymmetricKey};
pub use directory::{PublicKeyDirectory, PublicKeyRecord};
pub use envelope::EncryptedEnvelope;
pub use error::{Error, Result};
pub use facade::ConversationCryptoFacade;
pub use group::{ConversationKeys, GroupKeyEpoch, GroupKeyManager, GroupKeyTransport, WrappedKeyBlob};
pub use keyring::{KeyEntry, KeyRing, LocalStore};
pub use pairwise::{derive_dm_key, derive_dm_key_for_user};
