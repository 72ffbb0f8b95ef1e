//! # Key Ring Data Model
//!
//! The set of all key pairs a device has ever owned for a user, plus a
//! pointer to the currently active one.
//!
//! ## Wire Shape
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          KEY RING SHAPES                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Versioned ring (current)                                              │
//! │  ────────────────────────                                               │
//! │  {                                                                     │
//! │    "version": 1,                                                       │
//! │    "currentKeyId": "<hex sha-256 of public point>",                    │
//! │    "keys": {                                                           │
//! │      "<keyId>": {                                                      │
//! │        "publicKey":  { JWK },                                          │
//! │        "privateKey": { JWK },     // may be absent                     │
//! │        "createdAt":  1716400000000                                     │
//! │      }                                                                 │
//! │    }                                                                   │
//! │  }                                                                     │
//! │                                                                        │
//! │  Legacy single pair (accepted, upgraded in memory)                     │
//! │  ─────────────────────────────────────────────────                      │
//! │  { "publicKey": { JWK }, "privateKey": { JWK } }                       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Invariants: `currentKeyId` always indexes an entry in `keys`, and
//! `keys` is never empty once the ring exists. The ring is exclusively
//! owned by the local device process and never transmitted in cleartext.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::crypto::{IdentityKeyPair, Jwk};
use crate::error::{Error, Result};

/// Current key ring shape version
pub const RING_VERSION: u32 = 1;

/// One key pair the user has owned, keyed by its id in [`KeyRing::keys`]
///
/// The private half may be absent: a source (old backup, directory echo)
/// can know a key existed without holding its secret. Such an entry
/// cannot decrypt, but the id may still be referenced by old wrapped
/// blobs, so it is kept and may be completed by reconciliation later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyEntry {
    /// Public half as a JWK
    pub public_key: Jwk,
    /// Private half as a JWK, when this source holds it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<Jwk>,
    /// Creation time, unix milliseconds
    pub created_at: i64,
}

impl KeyEntry {
    /// Build an entry for a freshly generated keypair
    pub fn from_keypair(keypair: &IdentityKeyPair) -> Self {
        Self {
            public_key: keypair.public_jwk(),
            private_key: Some(keypair.private_jwk()),
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Reconstruct the keypair, failing if the private half is absent
    pub fn keypair(&self, key_id: &str) -> Result<IdentityKeyPair> {
        let private = self
            .private_key
            .as_ref()
            .ok_or_else(|| Error::NoPrivateKey(key_id.to_string()))?;
        IdentityKeyPair::from_jwk(private)
    }
}

/// A user's key ring on one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRing {
    /// Ring shape version (see [`RING_VERSION`])
    pub version: u32,
    /// Id of the currently active key; must index `keys`
    pub current_key_id: String,
    /// All key pairs ever owned, by key id. BTreeMap keeps serialization
    /// deterministic across devices.
    pub keys: BTreeMap<String, KeyEntry>,
}

/// A parsed ring plus how it arrived
///
/// `upgraded_from_legacy` tells the caller the source was the old bare
/// keypair shape and should be re-persisted/re-uploaded in ring form.
#[derive(Debug, Clone)]
pub struct ParsedRing {
    /// The (possibly upgraded) ring
    pub ring: KeyRing,
    /// True when the raw payload was a legacy bare keypair
    pub upgraded_from_legacy: bool,
}

impl KeyRing {
    /// Build a fresh ring around a newly generated keypair
    pub fn new(keypair: &IdentityKeyPair) -> Self {
        let key_id = keypair.key_id();
        let mut keys = BTreeMap::new();
        keys.insert(key_id.clone(), KeyEntry::from_keypair(keypair));
        Self {
            version: RING_VERSION,
            current_key_id: key_id,
            keys,
        }
    }

    /// Check the structural invariants
    pub fn validate(&self) -> Result<()> {
        if self.keys.is_empty() {
            return Err(Error::MalformedKeyRing("ring has no keys".into()));
        }
        if !self.keys.contains_key(&self.current_key_id) {
            return Err(Error::MalformedKeyRing(format!(
                "currentKeyId {} not present in keys",
                self.current_key_id
            )));
        }
        Ok(())
    }

    /// The entry `currentKeyId` points at
    pub fn current_entry(&self) -> Result<&KeyEntry> {
        self.keys
            .get(&self.current_key_id)
            .ok_or_else(|| Error::MalformedKeyRing("currentKeyId not present in keys".into()))
    }

    /// The currently active keypair
    pub fn current_keypair(&self) -> Result<IdentityKeyPair> {
        self.current_entry()?.keypair(&self.current_key_id)
    }

    /// The currently active public key as a JWK
    pub fn current_public_jwk(&self) -> Result<Jwk> {
        Ok(self.current_entry()?.public_key.clone())
    }

    /// Every keypair we hold the private half for, current first.
    ///
    /// Old wrapped blobs may reference retired keys, so unwrap paths walk
    /// this list rather than assuming the current key.
    pub fn decryption_keypairs(&self) -> Vec<(String, IdentityKeyPair)> {
        let mut out = Vec::new();
        if let Ok(current) = self.current_keypair() {
            out.push((self.current_key_id.clone(), current));
        }
        for (id, entry) in &self.keys {
            if *id == self.current_key_id {
                continue;
            }
            if let Ok(kp) = entry.keypair(id) {
                out.push((id.clone(), kp));
            }
        }
        out
    }

    /// Parse a raw JSON payload into a ring
    ///
    /// Accepts the versioned ring shape and the legacy bare keypair shape
    /// (`{publicKey, privateKey}`), upgrading the latter in memory. Any
    /// other shape, or a ring that breaks the invariants, is
    /// `MalformedKeyRing`.
    pub fn parse(raw: &serde_json::Value) -> Result<ParsedRing> {
        if raw.get("keys").is_some() {
            let ring: KeyRing = serde_json::from_value(raw.clone())
                .map_err(|e| Error::MalformedKeyRing(format!("ring did not parse: {}", e)))?;
            ring.validate()?;
            return Ok(ParsedRing {
                ring,
                upgraded_from_legacy: false,
            });
        }

        if raw.get("publicKey").is_some() {
            let public: Jwk = serde_json::from_value(raw["publicKey"].clone())
                .map_err(|e| Error::MalformedKeyRing(format!("legacy publicKey: {}", e)))?;
            let private: Option<Jwk> = match raw.get("privateKey") {
                Some(v) if !v.is_null() => Some(
                    serde_json::from_value(v.clone())
                        .map_err(|e| Error::MalformedKeyRing(format!("legacy privateKey: {}", e)))?,
                ),
                _ => None,
            };
            let ring = Self::from_legacy_pair(public, private)?;
            return Ok(ParsedRing {
                ring,
                upgraded_from_legacy: true,
            });
        }

        Err(Error::MalformedKeyRing(
            "payload is neither a ring nor a legacy keypair".into(),
        ))
    }

    /// Upgrade a legacy bare keypair into ring shape
    ///
    /// Legacy payloads carry no timestamp; the upgraded entry gets
    /// `createdAt` 0 so reconciliation treats it as the oldest claimant
    /// for `currentKeyId`.
    pub fn from_legacy_pair(public: Jwk, private: Option<Jwk>) -> Result<Self> {
        let public_point = crate::crypto::jwk_to_public_key(&public)
            .map_err(|e| Error::MalformedKeyRing(format!("legacy public key invalid: {}", e)))?;
        let key_id = crate::crypto::key_id_for(&public_point);

        let mut keys = BTreeMap::new();
        keys.insert(
            key_id.clone(),
            KeyEntry {
                public_key: public.to_public(),
                private_key: private,
                created_at: 0,
            },
        );
        Ok(Self {
            version: RING_VERSION,
            current_key_id: key_id,
            keys,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_ring_holds_invariant() {
        let ring = KeyRing::new(&IdentityKeyPair::generate());

        ring.validate().unwrap();
        assert_eq!(ring.keys.len(), 1);
        assert!(ring.keys.contains_key(&ring.current_key_id));
    }

    #[test]
    fn test_current_keypair_round_trips() {
        let kp = IdentityKeyPair::generate();
        let ring = KeyRing::new(&kp);

        assert_eq!(ring.current_keypair().unwrap().key_id(), kp.key_id());
    }

    #[test]
    fn test_serde_round_trip_camel_case() {
        let ring = KeyRing::new(&IdentityKeyPair::generate());

        let json = serde_json::to_value(&ring).unwrap();
        assert!(json.get("currentKeyId").is_some());
        assert!(json["keys"][&ring.current_key_id].get("createdAt").is_some());

        let parsed = KeyRing::parse(&json).unwrap();
        assert!(!parsed.upgraded_from_legacy);
        assert_eq!(parsed.ring, ring);
    }

    #[test]
    fn test_parse_legacy_pair_upgrades() {
        let kp = IdentityKeyPair::generate();
        let raw = serde_json::json!({
            "publicKey": kp.public_jwk(),
            "privateKey": kp.private_jwk(),
        });

        let parsed = KeyRing::parse(&raw).unwrap();
        assert!(parsed.upgraded_from_legacy);
        parsed.ring.validate().unwrap();
        assert_eq!(parsed.ring.current_key_id, kp.key_id());
        assert_eq!(parsed.ring.current_keypair().unwrap().key_id(), kp.key_id());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let raw = serde_json::json!({ "hello": "world" });
        assert!(matches!(
            KeyRing::parse(&raw),
            Err(Error::MalformedKeyRing(_))
        ));
    }

    #[test]
    fn test_parse_rejects_broken_invariant() {
        let mut ring = KeyRing::new(&IdentityKeyPair::generate());
        ring.current_key_id = "not-a-real-id".into();

        let raw = serde_json::to_value(&ring).unwrap();
        assert!(matches!(
            KeyRing::parse(&raw),
            Err(Error::MalformedKeyRing(_))
        ));
    }

    #[test]
    fn test_entry_without_private_half_cannot_decrypt() {
        let kp = IdentityKeyPair::generate();
        let mut ring = KeyRing::new(&kp);
        if let Some(entry) = ring.keys.get_mut(&kp.key_id()) {
            entry.private_key = None;
        }

        assert!(matches!(
            ring.current_keypair(),
            Err(Error::NoPrivateKey(_))
        ));
        assert!(ring.decryption_keypairs().is_empty());
    }

    #[test]
    fn test_decryption_keypairs_current_first() {
        let old = IdentityKeyPair::generate();
        let new = IdentityKeyPair::generate();

        let mut ring = KeyRing::new(&old);
        ring.keys
            .insert(new.key_id(), KeyEntry::from_keypair(&new));
        ring.current_key_id = new.key_id();

        let ids: Vec<String> = ring
            .decryption_keypairs()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], new.key_id());
    }
}
