use base64::Engine;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::cipher::{CryptoError, SharedKey};

/// Domain separator for the shared-key derivation.
const KDF_INFO: &[u8] = b"ponta-e2ee-v1";

/// X25519 public key, exchanged through the relay during the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "base64_serde")] [u8; 32]);

/// X25519 key pair for the E2EE handshake. The private half never
/// leaves this type; only the public key is exportable.
pub struct KeyPair {
    secret: StaticSecret,
    public: X25519Public,
}

impl KeyPair {
    /// Generate a fresh random key pair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.public.to_bytes())
    }

    /// Derive the symmetric channel key shared with `peer`.
    ///
    /// Both sides compute the identical key from complementary pairs:
    /// DH(a_priv, b_pub) == DH(b_priv, a_pub), expanded through
    /// HKDF-SHA256 into 32 key bytes.
    pub fn derive_shared(&self, peer: &PublicKey) -> Result<SharedKey, CryptoError> {
        let dh = self.secret.diffie_hellman(&X25519Public::from(peer.0));
        let hk = Hkdf::<Sha256>::new(None, dh.as_bytes());
        let mut okm = [0u8; 32];
        hk.expand(KDF_INFO, &mut okm)
            .map_err(|_| CryptoError::KeyDerivation)?;
        Ok(SharedKey::from_bytes(okm))
    }
}

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(self.0)
    }

    pub fn from_base64(s: &str) -> Result<Self, CryptoError> {
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self(arr))
    }
}

// Helper module for base64 serialization
mod base64_serde {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S, const N: usize>(bytes: &[u8; N], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);
        serializer.serialize_str(&encoded)
    }

    pub fn deserialize<'de, D, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(s)
            .map_err(serde::de::Error::custom)?;
        if bytes.len() != N {
            return Err(serde::de::Error::custom(format!(
                "expected {} bytes, got {}",
                N,
                bytes.len()
            )));
        }
        let mut arr = [0u8; N];
        arr.copy_from_slice(&bytes);
        Ok(arr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complementary_pairs_derive_same_key() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();

        let k_ab = alice.derive_shared(&bob.public_key()).unwrap();
        let k_ba = bob.derive_shared(&alice.public_key()).unwrap();

        // The derived keys must be interchangeable in both directions.
        let blob = k_ab.encrypt(b"handshake check").unwrap();
        assert_eq!(k_ba.decrypt(&blob).unwrap(), b"handshake check");

        let blob = k_ba.encrypt(b"other direction").unwrap();
        assert_eq!(k_ab.decrypt(&blob).unwrap(), b"other direction");
    }

    #[test]
    fn unrelated_pair_derives_different_key() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let mallory = KeyPair::generate();

        let k_ab = alice.derive_shared(&bob.public_key()).unwrap();
        let k_mb = mallory.derive_shared(&bob.public_key()).unwrap();

        let blob = k_ab.encrypt(b"secret").unwrap();
        assert!(k_mb.decrypt(&blob).is_err());
    }

    #[test]
    fn public_key_base64_roundtrip() {
        let keypair = KeyPair::generate();
        let public_key = keypair.public_key();

        let encoded = public_key.to_base64();
        let decoded = PublicKey::from_base64(&encoded).unwrap();

        assert_eq!(public_key, decoded);
    }

    #[test]
    fn public_key_serde_roundtrip() {
        let public_key = KeyPair::generate().public_key();

        let json = serde_json::to_string(&public_key).unwrap();
        let decoded: PublicKey = serde_json::from_str(&json).unwrap();

        assert_eq!(public_key, decoded);
    }

    #[test]
    fn rejects_wrong_length_public_key() {
        assert!(PublicKey::from_base64("dG9vLXNob3J0").is_err());
        assert!(PublicKey::from_base64("not base64 %%%").is_err());
    }
}
