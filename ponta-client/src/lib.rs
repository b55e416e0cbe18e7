//! Client session controller for the ponta relay.
//!
//! Owns one WebSocket connection to the relay, performs the identity
//! and authentication handshake, runs end-to-end key exchange with
//! peers, and encrypts/decrypts chat traffic. The application talks to
//! it through a command channel and listens on an event channel.

mod channels;
mod session;

pub use session::{ClientConfig, ClientHandle, Command, ChatEvent, SessionController};
