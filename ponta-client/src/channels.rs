use std::collections::HashMap;

use ponta_crypto::{channel_fingerprint, CryptoError, KeyPair, PublicKey, SharedKey};

/// Secure channel state for every peer this session has exchanged keys
/// with. The local key pair lives for the whole controller lifetime;
/// per-peer shared keys are dropped when the relay-side identity is
/// lost, forcing a fresh exchange.
pub(crate) struct ChannelMap {
    keypair: KeyPair,
    peers: HashMap<String, SharedKey>,
}

impl ChannelMap {
    pub fn new() -> Self {
        Self {
            keypair: KeyPair::generate(),
            peers: HashMap::new(),
        }
    }

    pub fn public_key_base64(&self) -> String {
        self.keypair.public_key().to_base64()
    }

    /// Derive and store the shared key for `peer_id`, returning the
    /// channel fingerprint both sides can compare out of band.
    pub fn establish(
        &mut self,
        peer_id: &str,
        peer_public: &PublicKey,
    ) -> Result<String, CryptoError> {
        let shared = self.keypair.derive_shared(peer_public)?;
        self.peers.insert(peer_id.to_string(), shared);
        Ok(channel_fingerprint(&self.keypair.public_key(), peer_public))
    }

    pub fn shared(&self, peer_id: &str) -> Option<&SharedKey> {
        self.peers.get(peer_id)
    }

    /// Forget every shared key. Peers still address us by relay id, so
    /// a new id invalidates all of them at once.
    pub fn clear(&mut self) {
        self.peers.clear();
    }
}
