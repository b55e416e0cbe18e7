use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroize;

/// AES-GCM nonce length in bytes (96 bits).
pub const NONCE_LEN: usize = 12;

/// GCM authentication tag length in bytes.
const TAG_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("key derivation failed")]
    KeyDerivation,
    #[error("invalid public key encoding")]
    InvalidPublicKey,
    #[error("encryption failed")]
    Encrypt,
    #[error("ciphertext failed authentication")]
    Decrypt,
    #[error("ciphertext too short: {0} bytes")]
    Truncated(usize),
    #[error("invalid base64 ciphertext")]
    InvalidEncoding,
}

/// Symmetric AES-256-GCM channel key derived via ECDH. Zeroized on
/// drop.
pub struct SharedKey([u8; 32]);

impl SharedKey {
    pub(crate) fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Encrypt `plaintext` under a fresh random 96-bit nonce and return
    /// `nonce || ciphertext`.
    ///
    /// Nonce reuse under one GCM key destroys confidentiality, so every
    /// call draws a new nonce from the OS RNG; nothing is ever derived
    /// from a counter that could repeat across restarts.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(&self.0).map_err(|_| CryptoError::Encrypt)?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Split the leading nonce and decrypt/authenticate the remainder.
    /// Tampered or wrong-key input yields an error, never partial
    /// plaintext.
    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if blob.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Truncated(blob.len()));
        }

        let cipher = Aes256Gcm::new_from_slice(&self.0).map_err(|_| CryptoError::Decrypt)?;
        let nonce = Nonce::from_slice(&blob[..NONCE_LEN]);

        cipher
            .decrypt(nonce, &blob[NONCE_LEN..])
            .map_err(|_| CryptoError::Decrypt)
    }

    /// Encrypt and encode for a JSON payload.
    pub fn encrypt_to_base64(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        let blob = self.encrypt(plaintext)?;
        Ok(base64::engine::general_purpose::STANDARD.encode(blob))
    }

    /// Decode a JSON payload and decrypt.
    pub fn decrypt_from_base64(&self, data: &str) -> Result<Vec<u8>, CryptoError> {
        let blob = base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|_| CryptoError::InvalidEncoding)?;
        self.decrypt(&blob)
    }
}

impl Drop for SharedKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KeyPair;

    fn test_key() -> SharedKey {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        a.derive_shared(&b.public_key()).unwrap()
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = test_key();
        let plaintext = b"ola, tudo bem?";

        let blob = key.encrypt(plaintext).unwrap();
        assert_eq!(key.decrypt(&blob).unwrap(), plaintext);
    }

    #[test]
    fn empty_plaintext_roundtrip() {
        let key = test_key();
        let blob = key.encrypt(b"").unwrap();
        assert_eq!(key.decrypt(&blob).unwrap(), b"");
    }

    #[test]
    fn same_plaintext_encrypts_differently() {
        let key = test_key();
        let a = key.encrypt(b"repeated message").unwrap();
        let b = key.encrypt(b"repeated message").unwrap();
        // Fresh nonce per call: identical plaintext never yields
        // identical output.
        assert_ne!(a, b);
    }

    #[test]
    fn any_single_bit_flip_fails_authentication() {
        let key = test_key();
        let blob = key.encrypt(b"integrity matters").unwrap();

        for byte in 0..blob.len() {
            for bit in 0..8 {
                let mut tampered = blob.clone();
                tampered[byte] ^= 1 << bit;
                assert!(
                    key.decrypt(&tampered).is_err(),
                    "bit {} of byte {} survived tampering",
                    bit,
                    byte
                );
            }
        }
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let key = test_key();
        let blob = key.encrypt(b"short").unwrap();

        assert!(matches!(
            key.decrypt(&blob[..NONCE_LEN]),
            Err(CryptoError::Truncated(_))
        ));
        assert!(matches!(key.decrypt(b""), Err(CryptoError::Truncated(0))));
    }

    #[test]
    fn base64_helpers_roundtrip() {
        let key = test_key();
        let data = key.encrypt_to_base64(b"wire format").unwrap();
        assert_eq!(key.decrypt_from_base64(&data).unwrap(), b"wire format");
        assert!(key.decrypt_from_base64("!!! not base64 !!!").is_err());
    }
}
