//! # Key Ring Reconciliation
//!
//! Merges key-ring material arriving from multiple sources (the local
//! ring, one or more decrypted backup bundles) into one canonical ring.
//!
//! Each device's ring is a local replica; this merge is deterministic,
//! commutative, and idempotent (union-with-preference), so repeated
//! reconciliation is always safe regardless of the order sources arrive
//! in.
//!
//! ## Precedence rules
//!
//! - `keys` is the union of all `keyId -> entry` pairs across sources.
//! - An entry carrying the private half always beats one without it.
//!   A private key is never silently discarded: a key id without its
//!   private half cannot decrypt, but old wrapped blobs may still
//!   reference it.
//! - `currentKeyId` is taken from the source whose declared current
//!   entry is newest (`createdAt`, key id as tie-break). If no source's
//!   declared current resolves to a merged entry, the merge fails and
//!   the caller falls back to fresh key generation.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use crate::keyring::ring::{KeyEntry, KeyRing, RING_VERSION};

/// What a merge combined, for the caller's side-effect policy
///
/// The facade persists and re-publishes every successful merge; it
/// additionally re-uploads a fresh backup whenever skipping the upload
/// would risk losing recoverability (see [`ReconcileReport::needs_backup_upload`]).
#[derive(Debug, Clone, Copy)]
pub struct ReconcileReport {
    /// Number of non-empty sources that contributed
    pub sources: usize,
    /// Local ring held private material absent from every backup source
    pub local_private_recovered: bool,
}

impl ReconcileReport {
    /// Whether the merged ring should be re-uploaded as a fresh backup
    ///
    /// `upgraded_legacy` is supplied by the caller, which saw the raw
    /// payload shapes before parsing.
    pub fn needs_backup_upload(&self, upgraded_legacy: bool) -> bool {
        self.sources > 1 || upgraded_legacy || self.local_private_recovered
    }
}

/// Merge the local ring with any number of decrypted backup rings
///
/// Returns `None` when there is nothing to merge or no source declares a
/// resolvable `currentKeyId`; the caller must then fall back to fresh
/// key generation.
pub fn reconcile(
    local: Option<&KeyRing>,
    backups: &[KeyRing],
) -> Option<(KeyRing, ReconcileReport)> {
    let sources: Vec<&KeyRing> = local.into_iter().chain(backups.iter()).collect();
    if sources.is_empty() {
        return None;
    }

    let mut merged: BTreeMap<String, KeyEntry> = BTreeMap::new();
    for source in &sources {
        for (id, entry) in &source.keys {
            match merged.entry(id.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(entry.clone());
                }
                Entry::Occupied(mut slot) => {
                    // Same id means same public key (the id is its hash);
                    // only the private half and timestamp can differ.
                    let existing = slot.get_mut();
                    if existing.private_key.is_none() && entry.private_key.is_some() {
                        existing.private_key = entry.private_key.clone();
                    }
                    if entry.created_at > existing.created_at {
                        existing.created_at = entry.created_at;
                    }
                }
            }
        }
    }

    // Newest declared current wins; tie-break on key id keeps the result
    // independent of source order.
    let current_key_id = sources
        .iter()
        .filter_map(|s| {
            merged
                .get(&s.current_key_id)
                .map(|e| (e.created_at, s.current_key_id.clone()))
        })
        .max()
        .map(|(_, id)| id)?;

    // Only meaningful when there was a backup to compare against; with no
    // backups the local ring trivially holds keys "no backup has" and a
    // re-upload would fire on every sign-in.
    let local_private_recovered = !backups.is_empty()
        && local.is_some_and(|local_ring| {
            local_ring.keys.iter().any(|(id, entry)| {
                entry.private_key.is_some()
                    && !backups
                        .iter()
                        .any(|b| b.keys.get(id).is_some_and(|e| e.private_key.is_some()))
            })
        });

    let ring = KeyRing {
        version: RING_VERSION,
        current_key_id,
        keys: merged,
    };
    debug_assert!(ring.validate().is_ok());

    let report = ReconcileReport {
        sources: sources.len(),
        local_private_recovered,
    };
    Some((ring, report))
}

// ============================================================================
// TESTS
// ============================================================================
