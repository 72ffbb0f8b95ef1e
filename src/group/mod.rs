//! # Group Key Management
//!
//! Epoch-based symmetric keys for group conversations.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        GROUP KEY EPOCHS                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  create ─► epoch v1: fresh key, wrapped per member                     │
//! │  add    ─► wrap the CURRENT key for the newcomer (no version bump;     │
//! │            they can read existing history)                             │
//! │  remove ─► epoch v+1: fresh key, wrapped for remaining members only    │
//! │            (the removed member keeps v but never sees v+1)             │
//! │                                                                         │
//! │  ensure_key resolution order:                                          │
//! │    (a) in-memory cache                                                 │
//! │    (b) local store                                                     │
//! │    (c) own wrapped blob embedded in the conversation object            │
//! │    (d) wrapped blob fetched from the key transport                     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The server is the arbiter of the version number: the client proposes
//! `current + 1` and the server stores what it is given, so concurrent
//! admin rotations resolve last-write-wins. A member caught holding a
//! stale epoch invalidates its cache and re-resolves.

pub mod blob;

pub use blob::WrappedKeyBlob;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::crypto::{IdentityKeyPair, SymmetricKey};
use crate::directory::{require_peer_key, PublicKeyDirectory};
use crate::error::{Error, Result};
use crate::keyring::{KeyRing, LocalStore};

/// One distribution of a group key: a version plus a wrap per member
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupKeyEpoch {
    /// The conversation this epoch belongs to
    pub conversation_id: String,
    /// Epoch version, monotonic from 1
    pub version: u32,
    /// Per-recipient wraps of the epoch key, by user id
    pub wrapped_keys: HashMap<String, WrappedKeyBlob>,
}

/// The key-related slice of a conversation object as the server sends it
///
/// `wrapped_keys` values stay raw JSON here: historical conversations
/// carry string-encoded blobs, and [`WrappedKeyBlob::parse`] is the one
/// place that distinction is handled.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationKeys {
    /// Conversation id
    pub conversation_id: String,
    /// Current key version the server reports; `None` before the first
    /// epoch exists
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_version: Option<u32>,
    /// Wraps of the current-version key embedded in the conversation
    /// object, by recipient user id
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub wrapped_keys: HashMap<String, serde_json::Value>,
}

/// Server-side storage and retrieval of wrapped group keys
#[async_trait]
pub trait GroupKeyTransport: Send + Sync {
    /// Fetch the wrap addressed to `user_id` for `(conversation, version)`
    async fn fetch_wrapped_key(
        &self,
        conversation_id: &str,
        version: u32,
        user_id: &str,
    ) -> Result<Option<serde_json::Value>>;

    /// Store a full epoch (creation or rotation). The server keeps what it
    /// is given; it performs no merge.
    async fn publish_epoch(&self, epoch: &GroupKeyEpoch) -> Result<()>;

    /// Store one additional wrap at an existing version (member addition)
    async fn publish_member_key(
        &self,
        conversation_id: &str,
        version: u32,
        user_id: &str,
        blob: &WrappedKeyBlob,
    ) -> Result<()>;
}

/// Resolves, caches, and distributes group epoch keys for one device
pub struct GroupKeyManager {
    user_id: String,
    store: Arc<dyn LocalStore>,
    directory: Arc<dyn PublicKeyDirectory>,
    transport: Arc<dyn GroupKeyTransport>,
    ring: Arc<RwLock<KeyRing>>,
    /// Resolved keys by `(conversation, version)`
    cache: RwLock<HashMap<(String, u32), SymmetricKey>>,
    /// One distribution at a time per conversation
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl GroupKeyManager {
    /// Create a manager bound to one user's ring and collaborators
    pub fn new(
        user_id: impl Into<String>,
        store: Arc<dyn LocalStore>,
        directory: Arc<dyn PublicKeyDirectory>,
        transport: Arc<dyn GroupKeyTransport>,
        ring: Arc<RwLock<KeyRing>>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            store,
            directory,
            transport,
            ring,
            cache: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn conversation_lock(&self, conversation_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(conversation_id.to_string())
            .or_default()
            .clone()
    }

    /// The newest version this device currently holds material for
    pub fn latest_cached_version(&self, conversation_id: &str) -> Option<u32> {
        self.cache
            .read()
            .keys()
            .filter(|(conv, _)| conv == conversation_id)
            .map(|(_, version)| *version)
            .max()
    }

    fn cache_key(&self, conversation_id: &str, version: u32, key: &SymmetricKey) -> Result<()> {
        self.store.save_group_key(conversation_id, version, key)?;
        self.cache
            .write()
            .insert((conversation_id.to_string(), version), key.clone());
        Ok(())
    }

    /// Drop all local material for `(conversation, version)`
    ///
    /// Called on suspected stale or corrupt material; the next
    /// [`ensure_key`](Self::ensure_key) re-resolves from scratch.
    pub fn invalidate(&self, conversation_id: &str, version: u32) -> Result<()> {
        self.cache
            .write()
            .remove(&(conversation_id.to_string(), version));
        self.store.delete_group_key(conversation_id, version)
    }

    /// Resolve the epoch key for `(conversation, desired_version)`
    ///
    /// Walks cache, store, embedded blob, then transport. A successful
    /// resolution is cached in memory and persisted; nothing is cached on
    /// a partial failure, so a cancelled call leaves no bad state behind.
    /// `Ok(None)` means no source could produce the key (e.g. this device
    /// was never given a wrap at that version).
    pub async fn ensure_key(
        &self,
        conversation: &ConversationKeys,
        desired_version: u32,
    ) -> Result<Option<SymmetricKey>> {
        let conversation_id = conversation.conversation_id.as_str();

        if let Some(key) = self
            .cache
            .read()
            .get(&(conversation_id.to_string(), desired_version))
        {
            return Ok(Some(key.clone()));
        }

        if let Some(key) = self.store.load_group_key(conversation_id, desired_version)? {
            self.cache
                .write()
                .insert((conversation_id.to_string(), desired_version), key.clone());
            return Ok(Some(key));
        }

        // The embedded wraps are for the conversation's current version only
        if conversation.key_version == Some(desired_version) {
            if let Some(raw) = conversation.wrapped_keys.get(&self.user_id) {
                let blob = WrappedKeyBlob::parse(raw)?;
                if let Some(key) = self.try_unwrap(&blob).await? {
                    debug!(conversation_id, version = desired_version, "resolved group key from embedded blob");
                    self.cache_key(conversation_id, desired_version, &key)?;
                    return Ok(Some(key));
                }
            }
        }

        if let Some(raw) = self
            .transport
            .fetch_wrapped_key(conversation_id, desired_version, &self.user_id)
            .await?
        {
            let blob = WrappedKeyBlob::parse(&raw)?;
            if let Some(key) = self.try_unwrap(&blob).await? {
                debug!(conversation_id, version = desired_version, "resolved group key from transport");
                self.cache_key(conversation_id, desired_version, &key)?;
                return Ok(Some(key));
            }
        }

        Ok(None)
    }

    /// Try every unwrap path for a blob addressed to us
    ///
    /// Embedded sender key first, directory lookup by `from` second, each
    /// against every identity keypair we still hold (old wraps may target
    /// a retired key).
    async fn try_unwrap(&self, blob: &WrappedKeyBlob) -> Result<Option<SymmetricKey>> {
        let keypairs: Vec<(String, IdentityKeyPair)> = self.ring.read().decryption_keypairs();

        for (_, keypair) in &keypairs {
            if let Ok(key) = blob.unwrap_embedded(keypair) {
                return Ok(Some(key));
            }
        }

        if let Some(sender_id) = &blob.from {
            let sender_jwk = match require_peer_key(self.directory.as_ref(), sender_id).await {
                Ok(jwk) => jwk,
                Err(Error::PeerKeyUnavailable { .. }) => return Ok(None),
                Err(e) => return Err(e),
            };
            let sender_public = crate::crypto::jwk_to_public_key(&sender_jwk)?;
            for (_, keypair) in &keypairs {
                if let Ok(key) = blob.unwrap_with(keypair, &sender_public) {
                    return Ok(Some(key));
                }
            }
        }

        Ok(None)
    }

    /// Generate and distribute a fresh epoch key
    ///
    /// Used for conversation creation (`current_version` 0 → epoch 1) and
    /// removal-triggered rotation. Every member must be resolvable in the
    /// directory or the whole distribution fails; a member without a wrap
    /// would be silently locked out.
    pub async fn distribute_new_key(
        &self,
        conversation_id: &str,
        member_ids: &[String],
        current_version: u32,
    ) -> Result<(SymmetricKey, GroupKeyEpoch)> {
        let lock = self.conversation_lock(conversation_id);
        let _guard = lock.lock().await;

        let sender = self.ring.read().current_keypair()?;
        let key = SymmetricKey::generate();
        let version = current_version + 1;

        let mut wrapped_keys = HashMap::with_capacity(member_ids.len());
        for member in member_ids {
            let jwk = require_peer_key(self.directory.as_ref(), member).await?;
            let public = crate::crypto::jwk_to_public_key(&jwk)?;
            let blob = WrappedKeyBlob::wrap(&key, &sender, &self.user_id, &public)?;
            wrapped_keys.insert(member.clone(), blob);
        }

        let epoch = GroupKeyEpoch {
            conversation_id: conversation_id.to_string(),
            version,
            wrapped_keys,
        };
        self.transport.publish_epoch(&epoch).await?;
        self.cache_key(conversation_id, version, &key)?;

        info!(
            conversation_id,
            version,
            members = member_ids.len(),
            "distributed new group key epoch"
        );
        Ok((key, epoch))
    }

    /// Wrap the current epoch key for a newly added member
    ///
    /// No version bump: the newcomer reads existing history. Fails with
    /// `NoCurrentKeyMaterial` when this device cannot resolve the current
    /// key yet (roster addition racing key availability is tolerated; the
    /// caller retries once material arrives).
    pub async fn add_member_to_current_epoch(
        &self,
        conversation: &ConversationKeys,
        new_member: &str,
    ) -> Result<WrappedKeyBlob> {
        let no_material = || Error::NoCurrentKeyMaterial {
            conversation_id: conversation.conversation_id.clone(),
        };
        let version = conversation.key_version.ok_or_else(no_material)?;
        let key = self
            .ensure_key(conversation, version)
            .await?
            .ok_or_else(no_material)?;

        let sender = self.ring.read().current_keypair()?;
        let jwk = require_peer_key(self.directory.as_ref(), new_member).await?;
        let public = crate::crypto::jwk_to_public_key(&jwk)?;
        let blob = WrappedKeyBlob::wrap(&key, &sender, &self.user_id, &public)?;

        self.transport
            .publish_member_key(&conversation.conversation_id, version, new_member, &blob)
            .await?;

        info!(
            conversation_id = %conversation.conversation_id,
            version,
            new_member,
            "wrapped current epoch key for added member"
        );
        Ok(blob)
    }
}

// ============================================================================
// IN-MEMORY TRANSPORT
// ============================================================================

/// Process-local key transport for tests
#[derive(Default)]
pub struct InMemoryGroupTransport {
    // conversation -> version -> user -> raw blob
    epochs: RwLock<HashMap<String, HashMap<u32, HashMap<String, serde_json::Value>>>>,
}

impl InMemoryGroupTransport {
    /// Create an empty transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any wrap exists for `user_id` at `(conversation, version)`
    pub fn has_wrap(&self, conversation_id: &str, version: u32, user_id: &str) -> bool {
        self.epochs
            .read()
            .get(conversation_id)
            .and_then(|versions| versions.get(&version))
            .is_some_and(|wraps| wraps.contains_key(user_id))
    }
}

#[async_trait]
impl GroupKeyTransport for InMemoryGroupTransport {
    async fn fetch_wrapped_key(
        &self,
        conversation_id: &str,
        version: u32,
        user_id: &str,
    ) -> Result<Option<serde_json::Value>> {
        Ok(self
            .epochs
            .read()
            .get(conversation_id)
            .and_then(|versions| versions.get(&version))
            .and_then(|wraps| wraps.get(user_id))
            .cloned())
    }

    async fn publish_epoch(&self, epoch: &GroupKeyEpoch) -> Result<()> {
        let mut wraps = HashMap::with_capacity(epoch.wrapped_keys.len());
        for (user, blob) in &epoch.wrapped_keys {
            wraps.insert(user.clone(), serde_json::to_value(blob)?);
        }
        self.epochs
            .write()
            .entry(epoch.conversation_id.clone())
            .or_default()
            .insert(epoch.version, wraps);
        Ok(())
    }

    async fn publish_member_key(
        &self,
        conversation_id: &str,
        version: u32,
        user_id: &str,
        blob: &WrappedKeyBlob,
    ) -> Result<()> {
        self.epochs
            .write()
            .entry(conversation_id.to_string())
            .or_default()
            .entry(version)
            .or_default()
            .insert(user_id.to_string(), serde_json::to_value(blob)?);
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{InMemoryDirectory, PublicKeyRecord};
    use crate::keyring::MemoryStore;

    struct Member {
        user_id: String,
        manager: GroupKeyManager,
    }

    async fn member(
        user_id: &str,
        directory: &Arc<InMemoryDirectory>,
        transport: &Arc<InMemoryGroupTransport>,
    ) -> Member {
        let keypair = IdentityKeyPair::generate();
        directory
            .publish(
                user_id,
                &PublicKeyRecord {
                    public_key: keypair.public_jwk(),
                },
            )
            .await
            .unwrap();
        let ring = Arc::new(RwLock::new(KeyRing::new(&keypair)));
        let manager = GroupKeyManager::new(
            user_id,
            Arc::new(MemoryStore::new()),
            directory.clone() as Arc<dyn PublicKeyDirectory>,
            transport.clone() as Arc<dyn GroupKeyTransport>,
            ring,
        );
        Member {
            user_id: user_id.to_string(),
            manager,
        }
    }

    fn conversation(id: &str, version: u32) -> ConversationKeys {
        ConversationKeys {
            conversation_id: id.to_string(),
            key_version: Some(version),
            wrapped_keys: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_distribute_then_members_resolve() {
        let directory = Arc::new(InMemoryDirectory::new());
        let transport = Arc::new(InMemoryGroupTransport::new());
        let alice = member("alice", &directory, &transport).await;
        let bob = member("bob", &directory, &transport).await;

        let (key, epoch) = alice
            .manager
            .distribute_new_key("conv", &[alice.user_id.clone(), bob.user_id.clone()], 0)
            .await
            .unwrap();
        assert_eq!(epoch.version, 1);
        assert_eq!(epoch.wrapped_keys.len(), 2);

        let resolved = bob
            .manager
            .ensure_key(&conversation("conv", 1), 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.as_bytes(), key.as_bytes());
    }

    #[tokio::test]
    async fn test_rotation_excludes_removed_member() {
        let directory = Arc::new(InMemoryDirectory::new());
        let transport = Arc::new(InMemoryGroupTransport::new());
        let alice = member("alice", &directory, &transport).await;
        let bob = member("bob", &directory, &transport).await;

        alice
            .manager
            .distribute_new_key("conv", &[alice.user_id.clone(), bob.user_id.clone()], 0)
            .await
            .unwrap();
        // Bob resolves v1 before removal
        assert!(bob
            .manager
            .ensure_key(&conversation("conv", 1), 1)
            .await
            .unwrap()
            .is_some());

        // Remove bob: rotate to v2 for alice only
        let (_, epoch) = alice
            .manager
            .distribute_new_key("conv", &[alice.user_id.clone()], 1)
            .await
            .unwrap();
        assert_eq!(epoch.version, 2);
        assert!(!transport.has_wrap("conv", 2, "bob"));

        // Bob still holds v1 but can never obtain v2
        assert!(bob
            .manager
            .ensure_key(&conversation("conv", 2), 1)
            .await
            .unwrap()
            .is_some());
        assert!(bob
            .manager
            .ensure_key(&conversation("conv", 2), 2)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_added_member_reads_current_epoch() {
        let directory = Arc::new(InMemoryDirectory::new());
        let transport = Arc::new(InMemoryGroupTransport::new());
        let alice = member("alice", &directory, &transport).await;
        let carol = member("carol", &directory, &transport).await;

        let (key, _) = alice
            .manager
            .distribute_new_key("conv", &[alice.user_id.clone()], 0)
            .await
            .unwrap();

        alice
            .manager
            .add_member_to_current_epoch(&conversation("conv", 1), &carol.user_id)
            .await
            .unwrap();

        // No version bump: carol resolves v1
        let resolved = carol
            .manager
            .ensure_key(&conversation("conv", 1), 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.as_bytes(), key.as_bytes());
    }

    #[tokio::test]
    async fn test_add_member_without_material_fails() {
        let directory = Arc::new(InMemoryDirectory::new());
        let transport = Arc::new(InMemoryGroupTransport::new());
        let alice = member("alice", &directory, &transport).await;

        let err = alice
            .manager
            .add_member_to_current_epoch(&conversation("conv", 7), "bob")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoCurrentKeyMaterial { .. }));
    }

    #[tokio::test]
    async fn test_distribute_fails_when_member_unpublished() {
        let directory = Arc::new(InMemoryDirectory::new());
        let transport = Arc::new(InMemoryGroupTransport::new());
        let alice = member("alice", &directory, &transport).await;

        let err = alice
            .manager
            .distribute_new_key("conv", &[alice.user_id.clone(), "ghost".into()], 0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PeerKeyUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_resolves_from_embedded_blob() {
        let directory = Arc::new(InMemoryDirectory::new());
        let transport = Arc::new(InMemoryGroupTransport::new());
        let alice = member("alice", &directory, &transport).await;
        let bob = member("bob", &directory, &transport).await;

        let (key, epoch) = alice
            .manager
            .distribute_new_key("conv", &[bob.user_id.clone()], 0)
            .await
            .unwrap();

        // Hand bob the blob embedded in the conversation object only,
        // string-encoded the way historical payloads arrive
        let blob = &epoch.wrapped_keys["bob"];
        let mut conv = conversation("conv", 1);
        conv.wrapped_keys.insert(
            "bob".into(),
            serde_json::Value::String(serde_json::to_string(blob).unwrap()),
        );

        let empty_transport = Arc::new(InMemoryGroupTransport::new());
        let bob_manager = GroupKeyManager::new(
            "bob",
            Arc::new(MemoryStore::new()),
            directory.clone() as Arc<dyn PublicKeyDirectory>,
            empty_transport as Arc<dyn GroupKeyTransport>,
            bob.manager.ring.clone(),
        );
        let resolved = bob_manager.ensure_key(&conv, 1).await.unwrap().unwrap();
        assert_eq!(resolved.as_bytes(), key.as_bytes());
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let directory = Arc::new(InMemoryDirectory::new());
        let transport = Arc::new(InMemoryGroupTransport::new());
        let alice = member("alice", &directory, &transport).await;

        let (key, _) = alice
            .manager
            .distribute_new_key("conv", &[alice.user_id.clone()], 0)
            .await
            .unwrap();
        assert_eq!(alice.manager.latest_cached_version("conv"), Some(1));

        alice.manager.invalidate("conv", 1).unwrap();
        assert_eq!(alice.manager.latest_cached_version("conv"), None);

        // Re-resolves through the transport wrap
        let resolved = alice
            .manager
            .ensure_key(&conversation("conv", 1), 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.as_bytes(), key.as_bytes());
    }
}
