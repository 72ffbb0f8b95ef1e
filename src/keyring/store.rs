//! # Local Key Storage
//!
//! Persistence for the key ring and resolved group keys on one device.
//!
//! The trait keeps the rest of the crate independent of where material
//! actually lives; the host application picks an implementation per
//! platform (file-backed by default, an OS keystore-backed one where the
//! platform offers it). Everything stored here is secret: group keys are
//! stored so resolved epochs survive restarts, and the ring so the
//! device keeps its identity.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use parking_lot::RwLock;

use crate::crypto::SymmetricKey;
use crate::error::{Error, Result};
use crate::keyring::ring::KeyRing;

/// Local persistence for key material
///
/// Methods are synchronous: implementations are expected to be local
/// disk or memory, not network services.
pub trait LocalStore: Send + Sync {
    /// Load the raw persisted ring payload, if any.
    ///
    /// Returned as raw JSON so the caller can run the tagged-union parse
    /// (versioned ring vs legacy bare pair) and decide what to do with a
    /// malformed payload.
    fn load_ring(&self) -> Result<Option<serde_json::Value>>;

    /// Persist the ring, replacing any previous payload
    fn save_ring(&self, ring: &KeyRing) -> Result<()>;

    /// Load a resolved group key for `(conversation_id, version)`
    fn load_group_key(&self, conversation_id: &str, version: u32) -> Result<Option<SymmetricKey>>;

    /// Persist a resolved group key for `(conversation_id, version)`
    fn save_group_key(
        &self,
        conversation_id: &str,
        version: u32,
        key: &SymmetricKey,
    ) -> Result<()>;

    /// Drop a persisted group key (stale-epoch invalidation)
    fn delete_group_key(&self, conversation_id: &str, version: u32) -> Result<()>;
}

fn group_key_slot(conversation_id: &str, version: u32) -> String {
    format!("{}:{}", conversation_id, version)
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

/// Volatile store for tests and ephemeral sessions
#[derive(Default)]
pub struct MemoryStore {
    ring: RwLock<Option<serde_json::Value>>,
    group_keys: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the raw ring payload (tests exercise malformed/legacy shapes)
    pub fn seed_ring(&self, raw: serde_json::Value) {
        *self.ring.write() = Some(raw);
    }
}

impl LocalStore for MemoryStore {
    fn load_ring(&self) -> Result<Option<serde_json::Value>> {
        Ok(self.ring.read().clone())
    }

    fn save_ring(&self, ring: &KeyRing) -> Result<()> {
        let raw = serde_json::to_value(ring)?;
        *self.ring.write() = Some(raw);
        Ok(())
    }

    fn load_group_key(&self, conversation_id: &str, version: u32) -> Result<Option<SymmetricKey>> {
        let slot = group_key_slot(conversation_id, version);
        match self.group_keys.read().get(&slot) {
            Some(encoded) => decode_group_key(encoded).map(Some),
            None => Ok(None),
        }
    }

    fn save_group_key(
        &self,
        conversation_id: &str,
        version: u32,
        key: &SymmetricKey,
    ) -> Result<()> {
        let slot = group_key_slot(conversation_id, version);
        self.group_keys
            .write()
            .insert(slot, BASE64.encode(key.as_bytes()));
        Ok(())
    }

    fn delete_group_key(&self, conversation_id: &str, version: u32) -> Result<()> {
        let slot = group_key_slot(conversation_id, version);
        self.group_keys.write().remove(&slot);
        Ok(())
    }
}

fn decode_group_key(encoded: &str) -> Result<SymmetricKey> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| Error::StorageReadError(format!("stored group key: {}", e)))?;
    SymmetricKey::from_slice(&bytes)
}

// ============================================================================
// FILE STORE
// ============================================================================

/// JSON-file-backed store rooted at a directory
///
/// Layout:
/// - `<root>/keyring.json` — the serialized ring
/// - `<root>/group_keys.json` — map of `"<conversationId>:<version>"` to
///   base64 key
///
/// Writes go through a temp file and rename so a crash mid-write never
/// leaves a truncated ring behind.
pub struct FileStore {
    root: PathBuf,
    // Serializes read-modify-write of group_keys.json
    lock: RwLock<()>,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `root`
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)
            .map_err(|e| Error::StorageWriteError(format!("create {}: {}", root.display(), e)))?;
        Ok(Self {
            root,
            lock: RwLock::new(()),
        })
    }

    fn ring_path(&self) -> PathBuf {
        self.root.join("keyring.json")
    }

    fn group_keys_path(&self) -> PathBuf {
        self.root.join("group_keys.json")
    }

    fn read_json(&self, path: &Path) -> Result<Option<serde_json::Value>> {
        match std::fs::read(path) {
            Ok(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| Error::StorageReadError(format!("{}: {}", path.display(), e)))?;
                Ok(Some(value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::StorageReadError(format!(
                "{}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn write_json(&self, path: &Path, value: &serde_json::Value) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes)
            .map_err(|e| Error::StorageWriteError(format!("{}: {}", tmp.display(), e)))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| Error::StorageWriteError(format!("{}: {}", path.display(), e)))?;
        Ok(())
    }

    fn load_group_map(&self) -> Result<HashMap<String, String>> {
        match self.read_json(&self.group_keys_path())? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(HashMap::new()),
        }
    }

    fn save_group_map(&self, map: &HashMap<String, String>) -> Result<()> {
        self.write_json(&self.group_keys_path(), &serde_json::to_value(map)?)
    }
}

impl LocalStore for FileStore {
    fn load_ring(&self) -> Result<Option<serde_json::Value>> {
        let _guard = self.lock.read();
        self.read_json(&self.ring_path())
    }

    fn save_ring(&self, ring: &KeyRing) -> Result<()> {
        let _guard = self.lock.write();
        self.write_json(&self.ring_path(), &serde_json::to_value(ring)?)
    }

    fn load_group_key(&self, conversation_id: &str, version: u32) -> Result<Option<SymmetricKey>> {
        let _guard = self.lock.read();
        let map = self.load_group_map()?;
        match map.get(&group_key_slot(conversation_id, version)) {
            Some(encoded) => decode_group_key(encoded).map(Some),
            None => Ok(None),
        }
    }

    fn save_group_key(
        &self,
        conversation_id: &str,
        version: u32,
        key: &SymmetricKey,
    ) -> Result<()> {
        let _guard = self.lock.write();
        let mut map = self.load_group_map()?;
        map.insert(
            group_key_slot(conversation_id, version),
            BASE64.encode(key.as_bytes()),
        );
        self.save_group_map(&map)
    }

    fn delete_group_key(&self, conversation_id: &str, version: u32) -> Result<()> {
        let _guard = self.lock.write();
        let mut map = self.load_group_map()?;
        map.remove(&group_key_slot(conversation_id, version));
        self.save_group_map(&map)
    }
}

// ============================================================================
// TESTS
// ============================================================================
