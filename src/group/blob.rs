//! # Wrapped Key Blobs
//!
//! The wire shape a group key travels in: the epoch key encrypted under
//! the pairwise key between the distributing admin and one recipient.
//!
//! ## Wire Shape
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        WRAPPED KEY BLOB                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  {                                                                     │
//! │    "ciphertext": "<b64: AES-GCM(pairwise key, epoch key bytes)>",      │
//! │    "iv":         "<b64: 12-byte nonce>",                               │
//! │    "senderPublicKey": { JWK },   // optional, preferred unwrap path    │
//! │    "from": "<sender user id>"    // optional, directory-lookup fallback │
//! │  }                                                                     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Historical payloads sometimes arrive JSON-string-encoded (the blob
//! serialized, then embedded as a string field); [`WrappedKeyBlob::parse`]
//! is the single decode point that accepts both encodings.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use p256::PublicKey;
use serde::{Deserialize, Serialize};

use crate::crypto::{decrypt, encrypt, IdentityKeyPair, Jwk, Nonce, SymmetricKey, NONCE_SIZE};
use crate::error::{Error, Result};
use crate::pairwise::derive_dm_key;

/// A group epoch key wrapped for one recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WrappedKeyBlob {
    /// AES-GCM ciphertext of the raw 32-byte epoch key, base64
    pub ciphertext: String,
    /// AES-GCM nonce, base64
    pub iv: String,
    /// The wrapper's public key, embedded so the recipient can unwrap
    /// without a directory round trip
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_public_key: Option<Jwk>,
    /// The wrapper's user id, for directory lookup when the embedded key
    /// is absent or fails
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

impl WrappedKeyBlob {
    /// Wrap an epoch key for one recipient
    ///
    /// The pairwise key between `sender` and `recipient_public` encrypts
    /// the raw key bytes. Both the sender's public key and user id are
    /// embedded so the recipient has two independent unwrap paths.
    pub fn wrap(
        key: &SymmetricKey,
        sender: &IdentityKeyPair,
        sender_user_id: &str,
        recipient_public: &PublicKey,
    ) -> Result<Self> {
        let pairwise = derive_dm_key(sender, recipient_public)?;
        let (nonce, ciphertext) = encrypt(&pairwise, key.as_bytes())?;
        Ok(Self {
            ciphertext: BASE64.encode(ciphertext),
            iv: BASE64.encode(nonce.as_bytes()),
            sender_public_key: Some(sender.public_jwk()),
            from: Some(sender_user_id.to_string()),
        })
    }

    /// Decode a blob that may be an object or a JSON-string-encoded object
    pub fn parse(raw: &serde_json::Value) -> Result<Self> {
        match raw {
            serde_json::Value::String(inner) => {
                let blob: Self = serde_json::from_str(inner)
                    .map_err(|e| Error::SerializationError(format!("wrapped key blob: {}", e)))?;
                Ok(blob)
            }
            serde_json::Value::Object(_) => {
                let blob: Self = serde_json::from_value(raw.clone())
                    .map_err(|e| Error::SerializationError(format!("wrapped key blob: {}", e)))?;
                Ok(blob)
            }
            _ => Err(Error::SerializationError(
                "wrapped key blob is neither an object nor a string".into(),
            )),
        }
    }

    /// Unwrap using a known sender public key
    pub fn unwrap_with(
        &self,
        recipient: &IdentityKeyPair,
        sender_public: &PublicKey,
    ) -> Result<SymmetricKey> {
        let pairwise = derive_dm_key(recipient, sender_public)?;
        let nonce = decode_nonce(&self.iv)?;
        let ciphertext = BASE64
            .decode(&self.ciphertext)
            .map_err(|e| Error::SerializationError(format!("blob ciphertext: {}", e)))?;
        let raw = decrypt(&pairwise, &nonce, &ciphertext)?;
        SymmetricKey::from_slice(&raw)
    }

    /// Unwrap using the embedded sender public key
    ///
    /// Fails with `InvalidKey` when the blob carries none; the caller then
    /// falls back to a directory lookup by [`WrappedKeyBlob::from`].
    pub fn unwrap_embedded(&self, recipient: &IdentityKeyPair) -> Result<SymmetricKey> {
        let jwk = self
            .sender_public_key
            .as_ref()
            .ok_or_else(|| Error::InvalidKey("blob has no embedded sender key".into()))?;
        let sender_public = crate::crypto::jwk_to_public_key(jwk)?;
        self.unwrap_with(recipient, &sender_public)
    }
}

fn decode_nonce(iv: &str) -> Result<Nonce> {
    let bytes = BASE64
        .decode(iv)
        .map_err(|e| Error::SerializationError(format!("blob iv: {}", e)))?;
    let bytes: [u8; NONCE_SIZE] = bytes
        .try_into()
        .map_err(|_| Error::SerializationError(format!("blob iv must be {} bytes", NONCE_SIZE)))?;
    Ok(Nonce::from_bytes(bytes))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_unwrap_embedded() {
        let admin = IdentityKeyPair::generate();
        let member = IdentityKeyPair::generate();
        let key = SymmetricKey::generate();

        let blob = WrappedKeyBlob::wrap(&key, &admin, "admin", &member.public_key()).unwrap();
        let unwrapped = blob.unwrap_embedded(&member).unwrap();

        assert_eq!(unwrapped.as_bytes(), key.as_bytes());
        assert_eq!(blob.from.as_deref(), Some("admin"));
    }

    #[test]
    fn test_unwrap_with_explicit_sender_key() {
        let admin = IdentityKeyPair::generate();
        let member = IdentityKeyPair::generate();
        let key = SymmetricKey::generate();

        let mut blob = WrappedKeyBlob::wrap(&key, &admin, "admin", &member.public_key()).unwrap();
        blob.sender_public_key = None;

        assert!(blob.unwrap_embedded(&member).is_err());
        let unwrapped = blob.unwrap_with(&member, &admin.public_key()).unwrap();
        assert_eq!(unwrapped.as_bytes(), key.as_bytes());
    }

    #[test]
    fn test_wrong_recipient_cannot_unwrap() {
        let admin = IdentityKeyPair::generate();
        let member = IdentityKeyPair::generate();
        let outsider = IdentityKeyPair::generate();
        let key = SymmetricKey::generate();

        let blob = WrappedKeyBlob::wrap(&key, &admin, "admin", &member.public_key()).unwrap();
        assert!(matches!(
            blob.unwrap_embedded(&outsider),
            Err(Error::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_parse_accepts_object_and_string() {
        let admin = IdentityKeyPair::generate();
        let member = IdentityKeyPair::generate();
        let key = SymmetricKey::generate();
        let blob = WrappedKeyBlob::wrap(&key, &admin, "admin", &member.public_key()).unwrap();

        let as_object = serde_json::to_value(&blob).unwrap();
        assert_eq!(WrappedKeyBlob::parse(&as_object).unwrap(), blob);

        let as_string = serde_json::Value::String(serde_json::to_string(&blob).unwrap());
        assert_eq!(WrappedKeyBlob::parse(&as_string).unwrap(), blob);
    }

    #[test]
    fn test_parse_rejects_other_shapes() {
        assert!(WrappedKeyBlob::parse(&serde_json::json!(42)).is_err());
        assert!(WrappedKeyBlob::parse(&serde_json::json!("not json")).is_err());
        assert!(WrappedKeyBlob::parse(&serde_json::json!({ "iv": "only" })).is_err());
    }

    #[test]
    fn test_wire_shape_camel_case() {
        let admin = IdentityKeyPair::generate();
        let member = IdentityKeyPair::generate();
        let blob =
            WrappedKeyBlob::wrap(&SymmetricKey::generate(), &admin, "admin", &member.public_key())
                .unwrap();

        let json = serde_json::to_value(&blob).unwrap();
        assert!(json.get("senderPublicKey").is_some());
        assert!(json.get("ciphertext").is_some());
        assert!(json.get("iv").is_some());
    }
}
