//! # Identity Keys
//!
//! P-256 key agreement keypairs and their JWK wire encoding.
//!
//! Every device owns a ring of these keypairs; the public half of the
//! current one is what the blind directory serves to peers. The JWK shape
//! is the exact wire format (`kty: "EC"`, `crv: "P-256"`, base64url
//! coordinates, private scalar in `d`), so a record round-trips through
//! the directory and the backup codec without loss.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Size of a P-256 field element / private scalar in bytes
const COORDINATE_SIZE: usize = 32;

/// A JSON Web Key restricted to the single shape this protocol uses:
/// an EC key on P-256.
///
/// Public keys omit `d`; private keys carry it. This is the exact object
/// published to the directory and embedded in wrapped key blobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type, always `"EC"`
    pub kty: String,
    /// Curve name, always `"P-256"`
    pub crv: String,
    /// X coordinate, base64url without padding
    pub x: String,
    /// Y coordinate, base64url without padding
    pub y: String,
    /// Private scalar, base64url without padding; absent on public keys
    #[serde(skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
}

impl Jwk {
    /// Check the fixed fields without touching the coordinates
    fn check_shape(&self) -> Result<()> {
        if self.kty != "EC" {
            return Err(Error::InvalidKey(format!("unsupported kty: {}", self.kty)));
        }
        if self.crv != "P-256" {
            return Err(Error::InvalidKey(format!("unsupported crv: {}", self.crv)));
        }
        Ok(())
    }

    /// Whether this JWK carries a private scalar
    pub fn has_private(&self) -> bool {
        self.d.is_some()
    }

    /// A copy of this JWK with the private scalar stripped
    pub fn to_public(&self) -> Jwk {
        Jwk {
            d: None,
            ..self.clone()
        }
    }
}

fn decode_coordinate(field: &str, value: &str) -> Result<[u8; COORDINATE_SIZE]> {
    let bytes = URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|e| Error::InvalidKey(format!("bad base64url in {}: {}", field, e)))?;
    bytes
        .try_into()
        .map_err(|_| Error::InvalidKey(format!("{} must be {} bytes", field, COORDINATE_SIZE)))
}

/// Parse the public half of a JWK into a P-256 public key
pub fn jwk_to_public_key(jwk: &Jwk) -> Result<PublicKey> {
    jwk.check_shape()?;
    let x = decode_coordinate("x", &jwk.x)?;
    let y = decode_coordinate("y", &jwk.y)?;

    // Uncompressed SEC1 point: 0x04 || x || y
    let mut sec1 = [0u8; 1 + 2 * COORDINATE_SIZE];
    sec1[0] = 0x04;
    sec1[1..1 + COORDINATE_SIZE].copy_from_slice(&x);
    sec1[1 + COORDINATE_SIZE..].copy_from_slice(&y);

    PublicKey::from_sec1_bytes(&sec1)
        .map_err(|e| Error::InvalidKey(format!("point not on curve: {}", e)))
}

/// Encode a P-256 public key as a (public) JWK
pub fn public_key_to_jwk(public: &PublicKey) -> Jwk {
    let point = public.to_encoded_point(false);
    // Uncompressed encoding always carries both coordinates
    let x = point.x().map(|c| c.to_vec()).unwrap_or_default();
    let y = point.y().map(|c| c.to_vec()).unwrap_or_default();
    Jwk {
        kty: "EC".into(),
        crv: "P-256".into(),
        x: URL_SAFE_NO_PAD.encode(x),
        y: URL_SAFE_NO_PAD.encode(y),
        d: None,
    }
}

/// Derive the stable key id for a public key
///
/// Lowercase hex SHA-256 of the uncompressed SEC1 point. Stable across
/// devices and directory round-trips, which is what lets wrapped blobs
/// reference keys by id years later.
pub fn key_id_for(public: &PublicKey) -> String {
    let point = public.to_encoded_point(false);
    hex::encode(Sha256::digest(point.as_bytes()))
}

/// A P-256 key agreement keypair
///
/// ## Security
///
/// - The private scalar is zeroized when this struct is dropped
///   (handled by `p256::SecretKey` itself)
/// - `Debug` output is redacted
#[derive(Clone)]
pub struct IdentityKeyPair {
    /// Private scalar (secret); p256::SecretKey zeroizes itself on drop
    secret: SecretKey,
}

impl IdentityKeyPair {
    /// Generate a new random keypair
    ///
    /// Uses the operating system's secure random number generator.
    pub fn generate() -> Self {
        Self {
            secret: SecretKey::random(&mut OsRng),
        }
    }

    /// Reconstruct a keypair from a private JWK
    ///
    /// Fails with `InvalidKey` if the JWK has no `d` or the scalar is out
    /// of range.
    pub fn from_jwk(jwk: &Jwk) -> Result<Self> {
        jwk.check_shape()?;
        let d = jwk
            .d
            .as_deref()
            .ok_or_else(|| Error::InvalidKey("JWK has no private scalar".into()))?;
        let scalar = decode_coordinate("d", d)?;
        let secret = SecretKey::from_slice(&scalar)
            .map_err(|e| Error::InvalidKey(format!("invalid private scalar: {}", e)))?;
        Ok(Self { secret })
    }

    /// The public half
    pub fn public_key(&self) -> PublicKey {
        self.secret.public_key()
    }

    /// The public half as a JWK (safe to publish)
    pub fn public_jwk(&self) -> Jwk {
        public_key_to_jwk(&self.public_key())
    }

    /// The full keypair as a private JWK (for the local ring and backups
    /// only; never transmitted in cleartext)
    pub fn private_jwk(&self) -> Jwk {
        let mut jwk = self.public_jwk();
        jwk.d = Some(URL_SAFE_NO_PAD.encode(self.secret.to_bytes()));
        jwk
    }

    /// The stable id of this keypair
    pub fn key_id(&self) -> String {
        key_id_for(&self.public_key())
    }

    /// Perform static Diffie-Hellman key agreement
    ///
    /// Returns the raw shared secret. Both parties compute the same value:
    /// - Alice: alice_secret × bob_public
    /// - Bob: bob_secret × alice_public
    ///
    /// Callers must run the result through HKDF before using it as a key
    /// (see [`crate::crypto::derive_pairwise_key`]).
    pub fn diffie_hellman(&self, their_public: &PublicKey) -> [u8; 32] {
        let shared = p256::ecdh::diffie_hellman(
            self.secret.to_nonzero_scalar(),
            their_public.as_affine(),
        );
        let mut out = [0u8; 32];
        out.copy_from_slice(shared.raw_secret_bytes().as_slice());
        out
    }
}

// Prevent accidental logging of the private scalar
impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IdentityKeyPair({}, [REDACTED])", &self.key_id()[..8])
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_generation() {
        let kp1 = IdentityKeyPair::generate();
        let kp2 = IdentityKeyPair::generate();

        assert_ne!(kp1.key_id(), kp2.key_id());
    }

    #[test]
    fn test_jwk_round_trip_private() {
        let kp = IdentityKeyPair::generate();
        let jwk = kp.private_jwk();

        let restored = IdentityKeyPair::from_jwk(&jwk).unwrap();
        assert_eq!(kp.key_id(), restored.key_id());
    }

    #[test]
    fn test_jwk_round_trip_public() {
        let kp = IdentityKeyPair::generate();
        let jwk = kp.public_jwk();

        let public = jwk_to_public_key(&jwk).unwrap();
        assert_eq!(public, kp.public_key());
        assert!(!jwk.has_private());
    }

    #[test]
    fn test_public_jwk_has_no_scalar() {
        let kp = IdentityKeyPair::generate();
        let stripped = kp.private_jwk().to_public();

        assert_eq!(stripped, kp.public_jwk());
        assert!(IdentityKeyPair::from_jwk(&stripped).is_err());
    }

    #[test]
    fn test_wrong_curve_rejected() {
        let mut jwk = IdentityKeyPair::generate().public_jwk();
        jwk.crv = "P-384".into();
        assert!(jwk_to_public_key(&jwk).is_err());
    }

    #[test]
    fn test_key_id_is_stable() {
        let kp = IdentityKeyPair::generate();
        let via_jwk = jwk_to_public_key(&kp.public_jwk()).unwrap();

        assert_eq!(kp.key_id(), key_id_for(&via_jwk));
        assert_eq!(kp.key_id().len(), 64); // hex SHA-256
    }

    #[test]
    fn test_diffie_hellman_commutes() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();

        let alice_shared = alice.diffie_hellman(&bob.public_key());
        let bob_shared = bob.diffie_hellman(&alice.public_key());

        assert_eq!(alice_shared, bob_shared);
    }

    #[test]
    fn test_debug_redacts() {
        let kp = IdentityKeyPair::generate();
        let debug = format!("{:?}", kp);
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains(&kp.private_jwk().d.unwrap()));
    }

    #[test]
    fn test_jwk_json_shape() {
        let jwk = IdentityKeyPair::generate().public_jwk();
        let json = serde_json::to_value(&jwk).unwrap();

        assert_eq!(json["kty"], "EC");
        assert_eq!(json["crv"], "P-256");
        assert!(json.get("d").is_none());
    }
}
