//! # Conversation Crypto Facade
//!
//! The single entry point the messaging layer talks to. Everything else
//! in the crate is plumbing behind this surface.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    CONVERSATION CRYPTO FACADE                           │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  bootstrap ──► load-or-create ring ─► publish ─► download backups      │
//! │               ─► open (skip bad passwords) ─► reconcile ─► persist /   │
//! │               re-publish / re-upload as the merge report dictates      │
//! │                                                                         │
//! │  encrypt_direct / decrypt_direct   pairwise key per message            │
//! │  encrypt_group / decrypt_group     epoch key via GroupKeyManager,      │
//! │                                    one invalidate-and-retry on a       │
//! │                                    failed decrypt                      │
//! │  create_group / add_member /       epoch lifecycle, published          │
//! │  rotate_after_removal              through the key transport           │
//! │  export_backup                     seal + upload                       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Degradation policy: a send or receive path never dies on a network
//! error. Directory and transport failures are converted to
//! `PeerKeyUnavailable` / `NoCurrentKeyMaterial` here at the boundary;
//! retry and backoff belong to the transport layer, not this crate.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::backup::{self, BackupBundle, BackupTransport};
use crate::directory::{require_peer_key, PublicKeyDirectory, PublicKeyRecord};
use crate::envelope::EncryptedEnvelope;
use crate::error::{Error, Result};
use crate::group::{ConversationKeys, GroupKeyEpoch, GroupKeyManager, GroupKeyTransport, WrappedKeyBlob};
use crate::keyring::{self, reconcile, KeyRing, LocalStore};
use crate::pairwise::derive_dm_key;

/// One user's sealed-session crypto state and its collaborators
pub struct ConversationCryptoFacade {
    user_id: String,
    directory: Arc<dyn PublicKeyDirectory>,
    backups: Arc<dyn BackupTransport>,
    ring: Arc<RwLock<KeyRing>>,
    groups: GroupKeyManager,
}

impl ConversationCryptoFacade {
    /// Bring up the key state for a session
    ///
    /// Loads or creates the ring, publishes the current public key, then
    /// folds in whatever backups the password can open. Backup problems
    /// degrade (logged, skipped) rather than block sign-in; the only hard
    /// failures here are local storage and the directory publish.
    pub async fn bootstrap(
        user_id: impl Into<String>,
        store: Arc<dyn LocalStore>,
        directory: Arc<dyn PublicKeyDirectory>,
        group_transport: Arc<dyn GroupKeyTransport>,
        backups: Arc<dyn BackupTransport>,
        backup_password: Option<&str>,
    ) -> Result<Self> {
        let user_id = user_id.into();
        let loaded = keyring::load_or_create(store.as_ref(), directory.as_ref(), &user_id).await?;

        let mut upgraded_legacy = loaded.upgraded_from_legacy;
        let mut backup_rings = Vec::new();
        if let Some(password) = backup_password {
            match backups.download_bundles(&user_id).await {
                Ok(raws) => {
                    for raw in raws {
                        match BackupBundle::parse(&raw).and_then(|b| backup::open(password, &b)) {
                            Ok(parsed) => {
                                upgraded_legacy |= parsed.upgraded_from_legacy;
                                backup_rings.push(parsed.ring);
                            }
                            Err(e) => {
                                warn!(%user_id, error = %e, "skipping unopenable backup bundle");
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(%user_id, error = %e, "backup download failed, continuing without");
                }
            }
        }

        let mut ring = loaded.ring;
        if let Some((merged, report)) = reconcile(Some(&ring), &backup_rings) {
            if merged != ring {
                info!(
                    user_id,
                    keys = merged.keys.len(),
                    "reconciled key ring from multiple sources"
                );
                store.save_ring(&merged)?;
                directory
                    .publish(
                        &user_id,
                        &PublicKeyRecord {
                            public_key: merged.current_public_jwk()?,
                        },
                    )
                    .await?;
                ring = merged;
            }
            if report.needs_backup_upload(upgraded_legacy) {
                if let Some(password) = backup_password {
                    match backup::seal(password, &ring) {
                        Ok(bundle) => {
                            if let Err(e) = backups.upload_bundle(&user_id, &bundle).await {
                                warn!(%user_id, error = %e, "backup re-upload failed");
                            } else {
                                info!(%user_id, "re-uploaded merged key ring backup");
                            }
                        }
                        Err(e) => warn!(%user_id, error = %e, "sealing merged ring failed"),
                    }
                }
            }
        }

        let ring = Arc::new(RwLock::new(ring));
        let groups = GroupKeyManager::new(
            user_id.clone(),
            store.clone(),
            directory.clone(),
            group_transport,
            ring.clone(),
        );
        Ok(Self {
            user_id,
            directory,
            backups,
            ring,
            groups,
        })
    }

    /// The id of the currently active identity key
    pub fn current_key_id(&self) -> String {
        self.ring.read().current_key_id.clone()
    }

    // ========================================================================
    // DIRECT MESSAGES
    // ========================================================================

    /// Encrypt a DM payload for a peer
    pub async fn encrypt_direct(
        &self,
        peer_user_id: &str,
        plaintext: &[u8],
    ) -> Result<EncryptedEnvelope> {
        let peer_public = self.resolve_peer(peer_user_id).await?;
        let mine = self.ring.read().current_keypair()?;
        let key = derive_dm_key(&mine, &peer_public)?;
        EncryptedEnvelope::seal(&key, plaintext, None)
    }

    /// Decrypt a DM payload from a peer
    ///
    /// Tries every identity keypair we still hold: the peer may have
    /// encrypted against a key we have since rotated away from.
    pub async fn decrypt_direct(
        &self,
        peer_user_id: &str,
        envelope: &EncryptedEnvelope,
    ) -> Result<Vec<u8>> {
        let peer_public = self.resolve_peer(peer_user_id).await?;
        let keypairs = self.ring.read().decryption_keypairs();

        let mut last = Error::DecryptionFailed("no identity key could decrypt".into());
        for (_, keypair) in keypairs {
            let key = derive_dm_key(&keypair, &peer_public)?;
            match envelope.open(&key) {
                Ok(plaintext) => return Ok(plaintext),
                Err(e @ Error::DecryptionFailed(_)) => last = e,
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    async fn resolve_peer(&self, peer_user_id: &str) -> Result<p256::PublicKey> {
        let jwk = require_peer_key(self.directory.as_ref(), peer_user_id)
            .await
            .map_err(|e| degrade_to_peer_unavailable(peer_user_id, e))?;
        crate::crypto::jwk_to_public_key(&jwk)
    }

    // ========================================================================
    // GROUP MESSAGES
    // ========================================================================

    /// Encrypt a group payload under the conversation's current epoch
    pub async fn encrypt_group(
        &self,
        conversation: &ConversationKeys,
        plaintext: &[u8],
    ) -> Result<EncryptedEnvelope> {
        let no_material = || Error::NoCurrentKeyMaterial {
            conversation_id: conversation.conversation_id.clone(),
        };
        let version = conversation.key_version.ok_or_else(no_material)?;

        if let Some(cached) = self.groups.latest_cached_version(&conversation.conversation_id) {
            if cached < version {
                // Not surfaced to callers; ensure_key re-resolves below
                debug!(error = %Error::StaleEpoch {
                    conversation_id: conversation.conversation_id.clone(),
                    cached,
                    server: version,
                }, "cached epoch behind server");
            }
        }

        let key = self
            .groups
            .ensure_key(conversation, version)
            .await
            .map_err(|e| degrade_to_no_material(&conversation.conversation_id, e))?
            .ok_or_else(no_material)?;
        EncryptedEnvelope::seal(&key, plaintext, Some(version))
    }

    /// Decrypt a group payload
    ///
    /// A failed decrypt with resolved material is treated as stale or
    /// corrupt local state: the cached key for that version is dropped and
    /// resolution runs once more before the failure is surfaced.
    pub async fn decrypt_group(
        &self,
        conversation: &ConversationKeys,
        envelope: &EncryptedEnvelope,
    ) -> Result<Vec<u8>> {
        let no_material = || Error::NoCurrentKeyMaterial {
            conversation_id: conversation.conversation_id.clone(),
        };
        let version = envelope
            .key_version
            .or(conversation.key_version)
            .ok_or_else(no_material)?;

        let key = self
            .groups
            .ensure_key(conversation, version)
            .await
            .map_err(|e| degrade_to_no_material(&conversation.conversation_id, e))?
            .ok_or_else(no_material)?;

        match envelope.open(&key) {
            Ok(plaintext) => Ok(plaintext),
            Err(Error::DecryptionFailed(_)) => {
                debug!(
                    conversation_id = %conversation.conversation_id,
                    version,
                    "group decrypt failed with cached key, invalidating and retrying"
                );
                self.groups
                    .invalidate(&conversation.conversation_id, version)?;
                let key = self
                    .groups
                    .ensure_key(conversation, version)
                    .await
                    .map_err(|e| degrade_to_no_material(&conversation.conversation_id, e))?
                    .ok_or_else(no_material)?;
                envelope.open(&key)
            }
            Err(e) => Err(e),
        }
    }

    // ========================================================================
    // EPOCH LIFECYCLE
    // ========================================================================

    /// Create the first epoch of a new group conversation
    pub async fn create_group(
        &self,
        conversation_id: &str,
        member_ids: &[String],
    ) -> Result<GroupKeyEpoch> {
        let (_, epoch) = self
            .groups
            .distribute_new_key(conversation_id, member_ids, 0)
            .await?;
        Ok(epoch)
    }

    /// Rotate to a fresh epoch after a member was removed
    ///
    /// `remaining_members` is the post-removal roster. The server stores
    /// whichever epoch arrives last when two admins race; a member caught
    /// on the losing epoch recovers through the decrypt retry path.
    pub async fn rotate_after_removal(
        &self,
        conversation: &ConversationKeys,
        remaining_members: &[String],
    ) -> Result<GroupKeyEpoch> {
        let current = conversation.key_version.unwrap_or(0);
        let (_, epoch) = self
            .groups
            .distribute_new_key(&conversation.conversation_id, remaining_members, current)
            .await?;
        Ok(epoch)
    }

    /// Grant a newly added member the current epoch key (no rotation)
    pub async fn add_member(
        &self,
        conversation: &ConversationKeys,
        new_member: &str,
    ) -> Result<WrappedKeyBlob> {
        self.groups
            .add_member_to_current_epoch(conversation, new_member)
            .await
    }

    // ========================================================================
    // BACKUP
    // ========================================================================

    /// Seal the current ring under a password and upload it
    pub async fn export_backup(&self, password: &str) -> Result<()> {
        let ring = self.ring.read().clone();
        let bundle = backup::seal(password, &ring)?;
        self.backups.upload_bundle(&self.user_id, &bundle).await?;
        info!(user_id = %self.user_id, "uploaded key ring backup");
        Ok(())
    }

    #[cfg(test)]
    fn ring_snapshot(&self) -> KeyRing {
        self.ring.read().clone()
    }
}

fn degrade_to_peer_unavailable(user_id: &str, e: Error) -> Error {
    match e {
        Error::DirectoryUnavailable(_) | Error::TransportError(_) | Error::Timeout(_) => {
            warn!(%user_id, error = %e, "directory unreachable, degrading");
            Error::PeerKeyUnavailable {
                user_id: user_id.to_string(),
            }
        }
        other => other,
    }
}

fn degrade_to_no_material(conversation_id: &str, e: Error) -> Error {
    match e {
        Error::DirectoryUnavailable(_) | Error::TransportError(_) | Error::Timeout(_) => {
            warn!(conversation_id, error = %e, "key fetch failed, degrading");
            Error::NoCurrentKeyMaterial {
                conversation_id: conversation_id.to_string(),
            }
        }
        other => other,
    }
}

// ============================================================================
// TESTS
// ============================================================================
