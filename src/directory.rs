//! # Public Key Directory
//!
//! The blind directory that maps user ids to their current public key.
//!
//! The directory is the only party-to-party discovery mechanism: a user
//! publishes the public half of their current ring key after every load,
//! create, or rotation, and peers fetch it to derive pairwise keys. The
//! server only ever sees public JWKs; nothing here can decrypt anything.
//!
//! The trait is async because the production implementation is a network
//! service. [`InMemoryDirectory`] backs the tests and single-process
//! demos.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::crypto::Jwk;
use crate::error::{Error, Result};

/// The wire record the directory stores per user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyRecord {
    /// The user's current public key
    pub public_key: Jwk,
}

/// Remote lookup and publication of public identity keys
///
/// Implementations map onto two endpoints of the key service: GET a
/// user's record and PUT the caller's own. Errors other than "no record"
/// should surface as [`Error::DirectoryUnavailable`]; the facade decides
/// how to degrade.
#[async_trait]
pub trait PublicKeyDirectory: Send + Sync {
    /// Fetch a user's current public key record
    ///
    /// `Ok(None)` means the user has never published (distinct from the
    /// directory being unreachable).
    async fn fetch(&self, user_id: &str) -> Result<Option<PublicKeyRecord>>;

    /// Publish the caller's current public key, replacing any previous one
    async fn publish(&self, user_id: &str, record: &PublicKeyRecord) -> Result<()>;
}

/// Fetch a peer's public key, mapping absence to [`Error::PeerKeyUnavailable`]
///
/// Shared by the pairwise and group paths: both need a hard error they
/// can show (or wrap) when the peer has never signed in.
pub async fn require_peer_key(
    directory: &dyn PublicKeyDirectory,
    user_id: &str,
) -> Result<Jwk> {
    match directory.fetch(user_id).await? {
        Some(record) => Ok(record.public_key),
        None => Err(Error::PeerKeyUnavailable {
            user_id: user_id.to_string(),
        }),
    }
}

// ============================================================================
// IN-MEMORY DIRECTORY
// ============================================================================

/// Process-local directory for tests
///
/// Records are stripped to their public half on publish, mirroring what a
/// correct server would store.
#[derive(Default)]
pub struct InMemoryDirectory {
    records: RwLock<HashMap<String, PublicKeyRecord>>,
}

impl InMemoryDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PublicKeyDirectory for InMemoryDirectory {
    async fn fetch(&self, user_id: &str) -> Result<Option<PublicKeyRecord>> {
        Ok(self.records.read().get(user_id).cloned())
    }

    async fn publish(&self, user_id: &str, record: &PublicKeyRecord) -> Result<()> {
        let sanitized = PublicKeyRecord {
            public_key: record.public_key.to_public(),
        };
        self.records
            .write()
            .insert(user_id.to_string(), sanitized);
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

    #[tokio::test]
    async fn test_publish_then_fetch() {
        let directory = InMemoryDirectory::new();
        let kp = IdentityKeyPair::generate();

        directory
            .publish(
                "alice",
                &PublicKeyRecord {
                    public_key: kp.public_jwk(),
                },
            )
            .await
            .unwrap();

        let record = directory.fetch("alice").await.unwrap().unwrap();
        assert_eq!(record.public_key, kp.public_jwk());
    }

    #[tokio::test]
    async fn test_fetch_unknown_user_is_none() {
        let directory = InMemoryDirectory::new();
        assert!(directory.fetch("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_publish_strips_private_scalar() {
        let directory = InMemoryDirectory::new();
        let kp = IdentityKeyPair::generate();

        directory
            .publish(
                "alice",
                &PublicKeyRecord {
                    public_key: kp.private_jwk(),
                },
            )
            .await
            .unwrap();

        let record = directory.fetch("alice").await.unwrap().unwrap();
        assert!(!record.public_key.has_private());
    }

    #[tokio::test]
    async fn test_republish_replaces() {
        let directory = InMemoryDirectory::new();
        let old = IdentityKeyPair::generate();
        let new = IdentityKeyPair::generate();

        for kp in [&old, &new] {
            directory
                .publish(
                    "alice",
                    &PublicKeyRecord {
                        public_key: kp.public_jwk(),
                    },
                )
                .await
                .unwrap();
        }

        let record = directory.fetch("alice").await.unwrap().unwrap();
        assert_eq!(record.public_key, new.public_jwk());
    }

    #[tokio::test]
    async fn test_require_peer_key_maps_absence() {
        let directory = InMemoryDirectory::new();

        let err = require_peer_key(&directory, "bob").await.unwrap_err();
        assert!(matches!(err, Error::PeerKeyUnavailable { user_id } if user_id == "bob"));
    }
}
