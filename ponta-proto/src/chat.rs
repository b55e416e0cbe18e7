//! Chat-layer payload conventions. These ride inside the `payload`
//! field of relayed envelopes and are opaque to the relay itself.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `{"kind":"key-exchange","publicKey":"<b64>","reply":bool}`
///
/// `reply: true` marks the second leg of the handshake so the receiver
/// does not answer with yet another key, which would loop forever.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyExchangePayload {
    pub kind: String,
    #[serde(rename = "publicKey")]
    pub public_key: String,
    #[serde(default)]
    pub reply: bool,
}

pub const KEY_EXCHANGE_KIND: &str = "key-exchange";

impl KeyExchangePayload {
    pub fn new(public_key: String, reply: bool) -> Self {
        Self {
            kind: KEY_EXCHANGE_KIND.to_string(),
            public_key,
            reply,
        }
    }
}

/// `{"encrypted":true,"data":"<base64(nonce || ciphertext)>"}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub encrypted: bool,
    pub data: String,
}

impl EncryptedPayload {
    pub fn new(data: String) -> Self {
        Self {
            encrypted: true,
            data,
        }
    }
}

/// Classified chat payload as seen by the receiving client.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatPayload {
    KeyExchange(KeyExchangePayload),
    Encrypted(EncryptedPayload),
    /// Anything sent before a secure channel exists.
    Plain(String),
}

impl ChatPayload {
    pub fn classify(payload: &Value) -> Option<ChatPayload> {
        if let Some(text) = payload.as_str() {
            return Some(ChatPayload::Plain(text.to_string()));
        }
        if payload.get("encrypted").and_then(Value::as_bool) == Some(true) {
            let enc: EncryptedPayload = serde_json::from_value(payload.clone()).ok()?;
            return Some(ChatPayload::Encrypted(enc));
        }
        if payload.get("kind").and_then(Value::as_str) == Some(KEY_EXCHANGE_KIND) {
            let kx: KeyExchangePayload = serde_json::from_value(payload.clone()).ok()?;
            return Some(ChatPayload::KeyExchange(kx));
        }
        None
    }
}
