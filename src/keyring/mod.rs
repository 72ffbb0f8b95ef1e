//! # Key Ring Lifecycle
//!
//! Everything that owns the device's asymmetric identity: the ring data
//! model ([`ring`]), where it lives ([`store`]), how multiple copies of it
//! merge ([`reconcile`]), and the load-or-create entry point below.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        RING LIFECYCLE                                   │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  load_or_create                                                        │
//! │  ──────────────                                                         │
//! │  store.load_ring() ──► parse ──► ok? ──────────────┐                   │
//! │        │                 │                          │                   │
//! │      (none)         (malformed: warn,               │                   │
//! │        │             discard)                       │                   │
//! │        └────────┬────────┘                          │                   │
//! │                 ▼                                   ▼                   │
//! │        generate fresh P-256 ring            publish current            │
//! │        persist ────────────────────────────► public key                │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A malformed local ring is not fatal: the device regenerates and keeps
//! working, at the cost of losing decrypt capability for prior content on
//! this device until reconciliation recovers the old private keys from a
//! backup.

pub mod reconcile;
pub mod ring;
pub mod store;

pub use reconcile::{reconcile, ReconcileReport};
pub use ring::{KeyEntry, KeyRing, ParsedRing, RING_VERSION};
pub use store::{FileStore, LocalStore, MemoryStore};

use tracing::{info, warn};

use crate::crypto::IdentityKeyPair;
use crate::directory::{PublicKeyDirectory, PublicKeyRecord};
use crate::error::Result;

/// Outcome of [`load_or_create`]
#[derive(Debug)]
pub struct LoadedRing {
    /// The ring now persisted and published
    pub ring: KeyRing,
    /// True when a fresh keypair was generated this call
    pub created: bool,
    /// True when the persisted payload was the legacy bare-pair shape
    pub upgraded_from_legacy: bool,
}

/// Load the device's ring, creating one if absent or unusable
///
/// The current public key is published to the directory on every path:
/// peers can only reach us through the directory, so an unpublished ring
/// is as good as no ring. A legacy bare-pair payload is upgraded and
/// re-persisted in ring shape.
pub async fn load_or_create(
    store: &dyn LocalStore,
    directory: &dyn PublicKeyDirectory,
    user_id: &str,
) -> Result<LoadedRing> {
    let mut created = false;
    let mut upgraded_from_legacy = false;

    let ring = match store.load_ring() {
        Ok(Some(raw)) => match KeyRing::parse(&raw) {
            Ok(parsed) => {
                if parsed.upgraded_from_legacy {
                    info!(user_id, "upgraded legacy keypair payload to ring shape");
                    upgraded_from_legacy = true;
                    store.save_ring(&parsed.ring)?;
                }
                parsed.ring
            }
            Err(e) => {
                // Regeneration loses decrypt capability for prior content
                // on this device until reconciliation recovers the keys.
                warn!(user_id, error = %e, "local key ring malformed, regenerating");
                create_and_persist(store, user_id, &mut created)?
            }
        },
        Ok(None) => create_and_persist(store, user_id, &mut created)?,
        // An unreadable payload (truncated file, invalid JSON) is the same
        // situation as a malformed one: regenerate rather than lock the
        // user out of every future session.
        Err(e) => {
            warn!(user_id, error = %e, "local key ring unreadable, regenerating");
            create_and_persist(store, user_id, &mut created)?
        }
    };

    let record = PublicKeyRecord {
        public_key: ring.current_public_jwk()?,
    };
    directory.publish(user_id, &record).await?;

    Ok(LoadedRing {
        ring,
        created,
        upgraded_from_legacy,
    })
}

fn create_and_persist(
    store: &dyn LocalStore,
    user_id: &str,
    created: &mut bool,
) -> Result<KeyRing> {
    let keypair = IdentityKeyPair::generate();
    let ring = KeyRing::new(&keypair);
    store.save_ring(&ring)?;
    info!(user_id, key_id = %ring.current_key_id, "generated new identity key ring");
    *created = true;
    Ok(ring)
}

// ============================================================================
// TESTS
// ============================================================================
