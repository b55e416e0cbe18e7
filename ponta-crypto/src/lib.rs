mod cipher;
mod fingerprint;
mod keypair;

pub use cipher::{CryptoError, SharedKey, NONCE_LEN};
pub use fingerprint::channel_fingerprint;
pub use keypair::{KeyPair, PublicKey};
