use anyhow::{Context, Result};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream};
use url::Url;

use ponta_crypto::PublicKey;
use ponta_proto::chat::{ChatPayload, KEY_EXCHANGE_KIND};
use ponta_proto::relay::ServerMessage;

use crate::channels::ChannelMap;

type WsSink = SplitSink<
    tokio_tungstenite::WebSocketStream<MaybeTlsStream<TcpStream>>,
    Message,
>;

const COMMAND_BUFFER: usize = 32;
const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay WebSocket endpoint, e.g. `ws://127.0.0.1:9595/ws`.
    pub url: String,
    /// Shared relay token; `None` when the relay runs without auth.
    pub token: Option<String>,
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            auto_reconnect: true,
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Command {
    SendText { target: String, text: String },
    StartKeyExchange { target: String },
    Disconnect,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// The relay issued us an identity.
    Ready { id: String },
    Authenticated,
    AuthFailed { message: String },
    /// Key exchange with `peer` completed; both sides can compare the
    /// fingerprint out of band.
    ChannelSecured { peer: String, fingerprint: String },
    MessageReceived { from: String, text: String },
    /// An encrypted payload arrived that we could not open.
    DecryptFailed { from: String },
    RelayError { message: String },
    /// The previous identity was resumed after a transport drop.
    Resumed { id: String },
    /// Resumption failed; we hold a fresh identity and all peer
    /// channels are gone.
    SessionLost { new_id: String },
    Closed,
}

/// Command side of a running session.
#[derive(Clone)]
pub struct ClientHandle {
    commands: mpsc::Sender<Command>,
}

impl ClientHandle {
    pub async fn send_text(&self, target: impl Into<String>, text: impl Into<String>) -> Result<()> {
        self.commands
            .send(Command::SendText {
                target: target.into(),
                text: text.into(),
            })
            .await
            .context("session task is gone")
    }

    pub async fn start_key_exchange(&self, target: impl Into<String>) -> Result<()> {
        self.commands
            .send(Command::StartKeyExchange {
                target: target.into(),
            })
            .await
            .context("session task is gone")
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.commands
            .send(Command::Disconnect)
            .await
            .context("session task is gone")
    }
}

pub struct SessionController;

impl SessionController {
    /// Spawn the session task. All transport and crypto state lives in
    /// that one task; the caller drives it through the returned handle
    /// and drains events from the receiver.
    pub fn connect(config: ClientConfig) -> (ClientHandle, mpsc::Receiver<ChatEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(run(config, cmd_rx, event_tx));
        (ClientHandle { commands: cmd_tx }, event_rx)
    }
}

#[derive(Debug, Clone)]
struct StoredSession {
    id: String,
    secret: String,
}

async fn run(
    config: ClientConfig,
    mut commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<ChatEvent>,
) {
    let mut stored: Option<StoredSession> = None;
    let mut channels = ChannelMap::new();
    let mut attempt: u32 = 0;

    loop {
        let manual = match run_connection(
            &config,
            &mut commands,
            &events,
            &mut stored,
            &mut channels,
            &mut attempt,
        )
        .await
        {
            Ok(manual) => manual,
            Err(e) => {
                warn!("session error: {:#}", e);
                false
            }
        };

        if manual || !config.auto_reconnect {
            break;
        }
        if attempt >= config.max_reconnect_attempts {
            warn!(
                "giving up after {} reconnect attempts",
                config.max_reconnect_attempts
            );
            break;
        }
        attempt += 1;
        info!(
            "reconnecting in {:?} (attempt {}/{})",
            config.reconnect_delay, attempt, config.max_reconnect_attempts
        );
        if !wait_before_retry(config.reconnect_delay, &mut commands, &events).await {
            break;
        }
    }

    let _ = events.send(ChatEvent::Closed).await;
}

/// Sleep out the reconnect delay while still honoring commands. A
/// disconnect issued during the backoff must never be followed by
/// another transport connection. Returns `false` when the application
/// disconnected and the retry is off.
async fn wait_before_retry(
    delay: Duration,
    commands: &mut mpsc::Receiver<Command>,
    events: &mpsc::Sender<ChatEvent>,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            cmd = commands.recv() => match cmd {
                None | Some(Command::Disconnect) => {
                    info!("disconnect during backoff, retry cancelled");
                    return false;
                }
                Some(_) => {
                    let _ = events
                        .send(ChatEvent::RelayError {
                            message: "not connected".to_string(),
                        })
                        .await;
                }
            }
        }
    }
}

/// One WebSocket connection, start to finish. Returns `true` when the
/// application asked for the disconnect (no retry), `false` when the
/// transport went away underneath us.
async fn run_connection(
    config: &ClientConfig,
    commands: &mut mpsc::Receiver<Command>,
    events: &mpsc::Sender<ChatEvent>,
    stored: &mut Option<StoredSession>,
    channels: &mut ChannelMap,
    attempt: &mut u32,
) -> Result<bool> {
    let url = Url::parse(&config.url).context("invalid relay URL")?;
    info!("connecting to relay: {}", url);
    let (ws_stream, _) = connect_async(url)
        .await
        .context("failed to connect to relay")?;
    let (tx, mut rx) = ws_stream.split();

    let mut conn = Connection {
        config,
        events,
        stored,
        channels,
        attempt,
        tx,
        pending_resume: None,
        awaiting_auth: false,
        requires_auth: false,
    };

    loop {
        tokio::select! {
            frame = rx.next() => {
                let Some(frame) = frame else {
                    return Ok(false);
                };
                match frame.context("websocket transport error")? {
                    Message::Text(text) => conn.on_text(&text).await?,
                    Message::Ping(payload) => {
                        conn.tx.send(Message::Pong(payload)).await.ok();
                    }
                    Message::Close(_) => {
                        info!("relay closed the connection");
                        return Ok(false);
                    }
                    _ => {}
                }
            }
            cmd = commands.recv() => {
                match cmd {
                    None | Some(Command::Disconnect) => {
                        conn.tx.send(Message::Close(None)).await.ok();
                        return Ok(true);
                    }
                    Some(cmd) => conn.on_command(cmd).await?,
                }
            }
        }
    }
}

struct Connection<'a> {
    config: &'a ClientConfig,
    events: &'a mpsc::Sender<ChatEvent>,
    stored: &'a mut Option<StoredSession>,
    channels: &'a mut ChannelMap,
    attempt: &'a mut u32,
    tx: WsSink,
    /// Fresh credentials held aside while a resume is in flight.
    pending_resume: Option<StoredSession>,
    awaiting_auth: bool,
    requires_auth: bool,
}

impl Connection<'_> {
    async fn on_text(&mut self, text: &str) -> Result<()> {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                debug!("dropping unparseable frame: {}", e);
                return Ok(());
            }
        };

        // The relay stamps `from` on every forwarded envelope; its own
        // control messages never carry one. That keeps a peer from
        // impersonating the relay through the forwarding path.
        if value.get("from").is_some() {
            self.on_envelope(&value).await?;
            return Ok(());
        }

        match serde_json::from_value::<ServerMessage>(value) {
            Ok(msg) => self.on_server_message(msg).await,
            Err(e) => {
                debug!("dropping unrecognized relay frame: {}", e);
                Ok(())
            }
        }
    }

    async fn on_server_message(&mut self, msg: ServerMessage) -> Result<()> {
        match msg {
            ServerMessage::YourId {
                id,
                session_secret,
                requires_auth,
            } => {
                self.requires_auth = requires_auth;
                if let Some(prev) = self.stored.clone() {
                    // Hold the fresh identity in reserve and try to get
                    // the old one back.
                    info!("attempting to resume session {}", prev.id);
                    self.pending_resume = Some(StoredSession {
                        id,
                        secret: session_secret,
                    });
                    self.send_json(&json!({
                        "type": "reconnect",
                        "id": prev.id,
                        "sessionSecret": prev.secret,
                    }))
                    .await?;
                } else {
                    info!("relay issued identity {}", id);
                    *self.stored = Some(StoredSession {
                        id: id.clone(),
                        secret: session_secret,
                    });
                    *self.attempt = 0;
                    self.emit(ChatEvent::Ready { id }).await;
                    self.authenticate_if_needed().await?;
                }
            }
            ServerMessage::Authenticated => {
                self.awaiting_auth = false;
                self.emit(ChatEvent::Authenticated).await;
            }
            ServerMessage::Reconnected { id } => {
                info!("resumed session {}", id);
                self.pending_resume = None;
                *self.attempt = 0;
                self.emit(ChatEvent::Resumed { id }).await;
            }
            ServerMessage::ReconnectFailed => {
                let Some(fresh) = self.pending_resume.take() else {
                    debug!("reconnect_failed without a pending resume");
                    return Ok(());
                };
                warn!("session resume refused, adopting fresh identity {}", fresh.id);
                let new_id = fresh.id.clone();
                *self.stored = Some(fresh);
                // Peers knew us by the old id; every channel is stale.
                self.channels.clear();
                *self.attempt = 0;
                self.emit(ChatEvent::SessionLost { new_id }).await;
                self.authenticate_if_needed().await?;
            }
            ServerMessage::Error { message } => {
                if self.awaiting_auth {
                    self.awaiting_auth = false;
                    self.emit(ChatEvent::AuthFailed { message }).await;
                } else {
                    self.emit(ChatEvent::RelayError { message }).await;
                }
            }
        }
        Ok(())
    }

    async fn on_envelope(&mut self, value: &Value) -> Result<()> {
        let Some(from) = value.get("from").and_then(Value::as_str) else {
            return Ok(());
        };
        let from = from.to_string();
        let Some(payload) = value.get("payload") else {
            debug!("envelope from {} has no payload", from);
            return Ok(());
        };

        match ChatPayload::classify(payload) {
            Some(ChatPayload::KeyExchange(kx)) => {
                let peer_public = match PublicKey::from_base64(&kx.public_key) {
                    Ok(pk) => pk,
                    Err(e) => {
                        warn!("invalid public key from {}: {}", from, e);
                        return Ok(());
                    }
                };
                let fingerprint = match self.channels.establish(&from, &peer_public) {
                    Ok(fp) => fp,
                    Err(e) => {
                        warn!("key derivation with {} failed: {}", from, e);
                        return Ok(());
                    }
                };
                if !kx.reply {
                    self.send_key_exchange(&from, true).await?;
                }
                self.emit(ChatEvent::ChannelSecured {
                    peer: from,
                    fingerprint,
                })
                .await;
            }
            Some(ChatPayload::Encrypted(enc)) => {
                let opened = self
                    .channels
                    .shared(&from)
                    .ok_or(())
                    .and_then(|key| key.decrypt_from_base64(&enc.data).map_err(|_| ()))
                    .and_then(|bytes| String::from_utf8(bytes).map_err(|_| ()));
                match opened {
                    Ok(text) => self.emit(ChatEvent::MessageReceived { from, text }).await,
                    Err(()) => self.emit(ChatEvent::DecryptFailed { from }).await,
                }
            }
            Some(ChatPayload::Plain(text)) => {
                self.emit(ChatEvent::MessageReceived { from, text }).await;
            }
            None => {
                debug!("ignoring unclassified payload from {}", from);
            }
        }
        Ok(())
    }

    async fn on_command(&mut self, cmd: Command) -> Result<()> {
        match cmd {
            Command::SendText { target, text } => {
                let Some(key) = self.channels.shared(&target) else {
                    // No plaintext fallback; the application must run
                    // key exchange first.
                    self.emit(ChatEvent::RelayError {
                        message: format!("no secure channel with {}", target),
                    })
                    .await;
                    return Ok(());
                };
                match key.encrypt_to_base64(text.as_bytes()) {
                    Ok(data) => {
                        self.send_json(&json!({
                            "type": "message",
                            "target": target,
                            "payload": { "encrypted": true, "data": data },
                        }))
                        .await?;
                    }
                    Err(e) => {
                        self.emit(ChatEvent::RelayError {
                            message: format!("encryption failed: {}", e),
                        })
                        .await;
                    }
                }
            }
            Command::StartKeyExchange { target } => {
                self.send_key_exchange(&target, false).await?;
            }
            Command::Disconnect => unreachable!("handled by the connection loop"),
        }
        Ok(())
    }

    async fn send_key_exchange(&mut self, target: &str, reply: bool) -> Result<()> {
        self.send_json(&json!({
            "type": "message",
            "target": target,
            "payload": {
                "kind": KEY_EXCHANGE_KIND,
                "publicKey": self.channels.public_key_base64(),
                "reply": reply,
            },
        }))
        .await
    }

    async fn authenticate_if_needed(&mut self) -> Result<()> {
        match (&self.config.token, self.requires_auth) {
            (Some(token), _) => {
                self.awaiting_auth = true;
                self.send_json(&json!({"type": "authenticate", "token": token}))
                    .await?;
            }
            (None, true) => {
                warn!("relay requires a token but none is configured");
                self.emit(ChatEvent::RelayError {
                    message: "relay requires a token but none is configured".to_string(),
                })
                .await;
            }
            (None, false) => {}
        }
        Ok(())
    }

    async fn send_json(&mut self, value: &Value) -> Result<()> {
        self.tx
            .send(Message::text(value.to_string()))
            .await
            .context("websocket send failed")
    }

    async fn emit(&self, event: ChatEvent) {
        if self.events.send(event).await.is_err() {
            debug!("event receiver dropped");
        }
    }
}
