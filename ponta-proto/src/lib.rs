pub mod chat;
pub mod relay;

pub use chat::{ChatPayload, EncryptedPayload, KeyExchangePayload};
pub use relay::{
    parse_client_frame, ClientControl, ClientFrame, Envelope, ProtocolError, ServerMessage,
};
