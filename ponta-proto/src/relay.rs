use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("missing or non-string `type` field")]
    MissingType,
    #[error("missing or non-string `target` field")]
    MissingTarget,
}

/// Relay -> client control messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Sent immediately after the transport connects. The id is always
    /// relay-issued; the session secret authorizes later resumption.
    #[serde(rename = "your-id")]
    YourId {
        id: String,
        #[serde(rename = "sessionSecret")]
        session_secret: String,
        #[serde(rename = "requiresAuth")]
        requires_auth: bool,
    },

    /// Shared-token authentication succeeded.
    #[serde(rename = "authenticated")]
    Authenticated,

    /// Session resumption succeeded; the connection now owns `id`.
    #[serde(rename = "reconnected")]
    Reconnected { id: String },

    /// Session resumption failed; the connection keeps its fresh id.
    #[serde(rename = "reconnect_failed")]
    ReconnectFailed,

    #[serde(rename = "error")]
    Error { message: String },
}

/// Client -> relay control messages. Everything else a client sends is
/// an [`Envelope`] forwarded opaquely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientControl {
    #[serde(rename = "authenticate")]
    Authenticate { token: String },

    #[serde(rename = "reconnect")]
    Reconnect {
        id: String,
        #[serde(rename = "sessionSecret")]
        session_secret: String,
    },
}

/// A forwardable envelope: any JSON object carrying a string `type` and
/// a string `target`. The relay stamps `from` and forwards the object
/// verbatim; it never interprets `payload` or any other field, so new
/// chat-layer message types need no relay changes.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    message_type: String,
    target: String,
    fields: Map<String, Value>,
}

impl Envelope {
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let fields = match value {
            Value::Object(map) => map,
            _ => return Err(ProtocolError::NotAnObject),
        };
        let message_type = fields
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?
            .to_string();
        let target = fields
            .get("target")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingTarget)?
            .to_string();
        Ok(Self {
            message_type,
            target,
            fields,
        })
    }

    /// Build an envelope from scratch (client side).
    pub fn new(message_type: &str, target: &str, payload: Value) -> Self {
        let mut fields = Map::new();
        fields.insert("type".to_string(), Value::String(message_type.to_string()));
        fields.insert("target".to_string(), Value::String(target.to_string()));
        fields.insert("payload".to_string(), payload);
        Self {
            message_type: message_type.to_string(),
            target: target.to_string(),
            fields,
        }
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn from(&self) -> Option<&str> {
        self.fields.get("from").and_then(Value::as_str)
    }

    pub fn payload(&self) -> Option<&Value> {
        self.fields.get("payload")
    }

    /// Overwrite `from` with the relay-issued sender identity. Any
    /// client-supplied value is discarded; `from` is never trusted from
    /// the wire.
    pub fn stamp_from(&mut self, sender_id: &str) {
        self.fields
            .insert("from".to_string(), Value::String(sender_id.to_string()));
    }

    pub fn to_json(&self) -> String {
        // A Map of valid JSON values cannot fail to serialize.
        serde_json::to_string(&Value::Object(self.fields.clone()))
            .unwrap_or_else(|_| String::from("{}"))
    }
}

/// A parsed client frame: either a control message the relay acts on,
/// or an envelope it forwards.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Control(ClientControl),
    Envelope(Envelope),
}

pub fn parse_client_frame(raw: &[u8]) -> Result<ClientFrame, ProtocolError> {
    let value: Value = serde_json::from_slice(raw)?;
    let message_type = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?;
    match message_type {
        "authenticate" | "reconnect" => {
            let control: ClientControl = serde_json::from_value(value)?;
            Ok(ClientFrame::Control(control))
        }
        _ => Ok(ClientFrame::Envelope(Envelope::from_value(value)?)),
    }
}
