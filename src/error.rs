//! # Error Handling
//!
//! Error types for the Vesper key lifecycle core.
//!
//! ## Error Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR HIERARCHY                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Error (top-level)                                                     │
//! │  │                                                                      │
//! │  ├── Key Ring Errors                                                   │
//! │  │   ├── MalformedKeyRing      - Local ring corrupt, regenerated       │
//! │  │   ├── NoPrivateKey          - Entry present but private half gone   │
//! │  │   └── InvalidKey            - Key bytes/JWK don't parse             │
//! │  │                                                                      │
//! │  ├── Conversation Key Errors                                           │
//! │  │   ├── PeerKeyUnavailable    - Peer never published a public key     │
//! │  │   ├── NoCurrentKeyMaterial  - Group key not resolvable yet          │
//! │  │   └── StaleEpoch            - Cached key behind server's version    │
//! │  │                                                                      │
//! │  ├── Crypto Errors                                                     │
//! │  │   ├── EncryptionFailed      - AEAD seal failed                      │
//! │  │   ├── DecryptionFailed      - Auth tag mismatch, never partial      │
//! │  │   └── KeyDerivationFailed   - ECDH/HKDF/PBKDF2 failure              │
//! │  │                                                                      │
//! │  ├── Storage Errors                                                    │
//! │  │   ├── StorageReadError      - Failed to read local store            │
//! │  │   └── StorageWriteError     - Failed to write local store           │
//! │  │                                                                      │
//! │  └── Network Errors                                                    │
//! │      ├── DirectoryUnavailable  - Public key directory unreachable      │
//! │      ├── TransportError        - Wrapped-key/backup relay failed       │
//! │      └── Timeout               - Remote call timed out                 │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Network failures never crash a send/receive path: the facade converts
//! them to `PeerKeyUnavailable`/`NoCurrentKeyMaterial` at the boundary,
//! and retry/backoff is the transport layer's job, not this crate's.

use thiserror::Error;

/// Result type alias for Vesper Core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Vesper Core
///
/// All errors are categorized by module/domain to make error handling
/// clearer and to provide meaningful error messages to users.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Key Ring Errors (100-199)
    // ========================================================================
    /// The locally persisted key ring is missing required fields or breaks
    /// the `currentKeyId ∈ keys` invariant. Triggers regeneration.
    #[error("Malformed key ring: {0}")]
    MalformedKeyRing(String),

    /// A ring entry exists but carries no private half
    #[error("No private key material for key id {0}")]
    NoPrivateKey(String),

    /// Key bytes or JWK fields failed to parse
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    // ========================================================================
    // Conversation Key Errors (200-299)
    // ========================================================================
    /// The peer has never published a public key to the directory.
    /// User-actionable: ask them to open the app once.
    #[error("No published public key for user {user_id}. They need to sign in at least once.")]
    PeerKeyUnavailable {
        /// The peer whose key is missing
        user_id: String,
    },

    /// The group's symmetric key is not resolvable for an operation that
    /// needs it (no cache, no persisted copy, no wrap for us)
    #[error("No current key material for conversation {conversation_id}")]
    NoCurrentKeyMaterial {
        /// The conversation whose key is missing
        conversation_id: String,
    },

    /// The locally cached group key version is behind the server's.
    /// Triggers re-resolution, never shown to the end user.
    #[error("Stale epoch for conversation {conversation_id}: cached v{cached}, server v{server}")]
    StaleEpoch {
        /// The conversation affected
        conversation_id: String,
        /// Newest version we hold material for
        cached: u32,
        /// Version the server reports
        server: u32,
    },

    // ========================================================================
    // Crypto Errors (300-399)
    // ========================================================================
    /// Encryption failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed: authentication tag mismatch, wrong key, or
    /// tampered ciphertext. Never yields partial plaintext.
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Key derivation failed
    #[error("Failed to derive keys: {0}")]
    KeyDerivationFailed(String),

    // ========================================================================
    // Storage Errors (400-499)
    // ========================================================================
    /// Failed to read from local storage
    #[error("Failed to read from storage: {0}")]
    StorageReadError(String),

    /// Failed to write to local storage
    #[error("Failed to write to storage: {0}")]
    StorageWriteError(String),

    // ========================================================================
    // Network Errors (500-599)
    // ========================================================================
    /// Public key directory is unreachable
    #[error("Public key directory unavailable: {0}")]
    DirectoryUnavailable(String),

    /// Wrapped-key or backup relay call failed
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Remote call timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    // ========================================================================
    // Internal Errors (900-999)
    // ========================================================================
    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Internal error (should not happen in normal operation)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Get the numeric error code for the host application boundary
    ///
    /// Error codes are organized by category:
    /// - 100-199: Key ring
    /// - 200-299: Conversation keys
    /// - 300-399: Crypto
    /// - 400-499: Storage
    /// - 500-599: Network
    /// - 900-999: Internal
    pub fn code(&self) -> i32 {
        match self {
            // Key ring (100-199)
            Error::MalformedKeyRing(_) => 100,
            Error::NoPrivateKey(_) => 101,
            Error::InvalidKey(_) => 102,

            // Conversation keys (200-299)
            Error::PeerKeyUnavailable { .. } => 200,
            Error::NoCurrentKeyMaterial { .. } => 201,
            Error::StaleEpoch { .. } => 202,

            // Crypto (300-399)
            Error::EncryptionFailed(_) => 300,
            Error::DecryptionFailed(_) => 301,
            Error::KeyDerivationFailed(_) => 302,

            // Storage (400-499)
            Error::StorageReadError(_) => 400,
            Error::StorageWriteError(_) => 401,

            // Network (500-599)
            Error::DirectoryUnavailable(_) => 500,
            Error::TransportError(_) => 501,
            Error::Timeout(_) => 502,

            // Internal (900-999)
            Error::SerializationError(_) => 900,
            Error::Internal(_) => 901,
        }
    }

    /// Check if this error is recoverable at the UI boundary
    ///
    /// Recoverable errors can be resolved by retrying or by user action.
    /// `MalformedKeyRing` is the exception: it is self-healing through
    /// regeneration, at the cost of losing decrypt capability for prior
    /// content on this device until reconciliation recovers it.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::MalformedKeyRing(_) | Error::Internal(_))
    }

    /// Check if this error requires user action
    pub fn requires_user_action(&self) -> bool {
        matches!(self, Error::PeerKeyUnavailable { .. })
    }
}

// ============================================================================
// ERROR CONVERSIONS
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::StorageReadError(err.to_string())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::MalformedKeyRing("test".into()).code(), 100);
        assert_eq!(
            Error::PeerKeyUnavailable {
                user_id: "alice".into()
            }
            .code(),
            200
        );
        assert_eq!(Error::EncryptionFailed("test".into()).code(), 300);
        assert_eq!(Error::StorageReadError("test".into()).code(), 400);
        assert_eq!(Error::DirectoryUnavailable("test".into()).code(), 500);
        assert_eq!(Error::Internal("test".into()).code(), 901);
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(Error::Timeout("test".into()).is_recoverable());
        assert!(Error::DecryptionFailed("test".into()).is_recoverable());
        assert!(!Error::MalformedKeyRing("test".into()).is_recoverable());
    }

    #[test]
    fn test_peer_key_unavailable_is_user_actionable() {
        let err = Error::PeerKeyUnavailable {
            user_id: "bob".into(),
        };
        assert!(err.requires_user_action());
        assert!(err.to_string().contains("bob"));
    }
}
