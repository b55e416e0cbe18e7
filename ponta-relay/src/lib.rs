//! Ponta Relay Server Library
//!
//! Core signaling-relay functionality shared by the binary and the
//! integration tests. The relay brokers identities and forwards opaque
//! envelopes between clients; payloads are never parsed beyond the
//! routing fields, so encrypted chat traffic passes through untouched.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use futures::{SinkExt, StreamExt};
use rand::RngCore;
use tokio::sync::{mpsc, Mutex};
use tokio::time::interval;
use uuid::Uuid;
use warp::filters::BoxedFilter;
use warp::ws::{Message, WebSocket};
use warp::{Filter, Reply};

use ponta_proto::relay::{parse_client_frame, ClientControl, ClientFrame, ServerMessage};

/// Channel buffer size - prevents unbounded memory growth
pub const CHANNEL_BUFFER_SIZE: usize = 1024;

/// Heartbeat interval in seconds. A connection that shows no traffic
/// (data or pong) for a full interval is reclaimed on the next tick.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Default per-source-address connection cap
pub const DEFAULT_MAX_CONNS_PER_IP: usize = 10;

pub type Tx = mpsc::Sender<Message>;

/// A live connection bound to a relay-issued identity.
pub struct ClientHandle {
    pub tx: Tx,
    /// Authorizes session resumption after this connection drops.
    pub session_secret: String,
    pub authenticated: bool,
    /// Last traffic of any kind, updated by the connection task.
    pub last_seen: Arc<Mutex<Instant>>,
}

/// A closed identity eligible for resumption. No TTL: entries live
/// until the process restarts (known growth gap, see DESIGN.md).
pub struct ResumableSession {
    pub session_secret: String,
    pub authenticated: bool,
}

/// Identity routing table. One lock guards both maps so a rebind is
/// atomic with respect to message routing: a resumed identity can
/// never be observed half-moved.
#[derive(Default)]
pub struct Registry {
    pub live: HashMap<String, ClientHandle>,
    pub resumable: HashMap<String, ResumableSession>,
}

pub struct State {
    pub registry: Mutex<Registry>,
    /// Live connection count per source address.
    pub per_ip: Mutex<HashMap<IpAddr, usize>>,
    /// Shared authentication token; `None` disables auth enforcement.
    pub auth_token: Option<Arc<String>>,
    pub max_conns_per_ip: usize,
}

impl Default for State {
    fn default() -> Self {
        Self {
            registry: Mutex::default(),
            per_ip: Mutex::default(),
            auth_token: None,
            max_conns_per_ip: DEFAULT_MAX_CONNS_PER_IP,
        }
    }
}

/// Warp routes for the relay: hello, healthz and the `/ws` endpoint.
pub fn routes(state: Arc<State>) -> BoxedFilter<(impl Reply,)> {
    let with_state = warp::any().map(move || state.clone());

    let hello = warp::path::end().map(|| "Ponta Relay is Active");
    let healthz = warp::path!("healthz").map(|| "ok");

    let ws_route = warp::path!("ws")
        .and(warp::ws())
        .and(warp::query::<HashMap<String, String>>())
        .and(warp::addr::remote())
        .and(with_state)
        .map(
            |ws: warp::ws::Ws,
             query: HashMap<String, String>,
             remote: Option<SocketAddr>,
             state: Arc<State>| {
                ws.on_upgrade(move |socket| client_session(socket, remote, query, state))
            },
        );

    hello
        .or(healthz)
        .or(ws_route)
        .with(warp::cors().allow_any_origin())
        .with(warp::log("ponta_relay"))
        .boxed()
}

fn server_text(msg: &ServerMessage) -> Message {
    Message::text(serde_json::to_string(msg).unwrap())
}

fn generate_session_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Handle one client connection from admission to cleanup.
pub async fn client_session(
    ws: WebSocket,
    remote: Option<SocketAddr>,
    query: HashMap<String, String>,
    state: Arc<State>,
) {
    // Admission control before any identity is issued.
    if let Some(addr) = remote {
        let mut per_ip = state.per_ip.lock().await;
        let count = per_ip.entry(addr.ip()).or_insert(0);
        if *count >= state.max_conns_per_ip {
            drop(per_ip);
            log::warn!(
                "connection rejected: {} exceeded {} connections",
                addr.ip(),
                state.max_conns_per_ip
            );
            let (mut ws_tx, _ws_rx) = ws.split();
            let _ = ws_tx
                .send(Message::close_with(4429u16, "too_many_connections"))
                .await;
            return;
        }
        *count += 1;
    }

    // Self-chosen identifiers enable impersonation; they are never
    // honored, only logged.
    if let Some(requested) = query.get("id") {
        log::warn!(
            "ignoring client-supplied id {:?}; identities are relay-issued",
            requested
        );
    }

    let mut my_id = Uuid::new_v4().to_string();
    let session_secret = generate_session_secret();
    let requires_auth = state.auth_token.is_some();
    let mut authenticated = !requires_auth;
    let last_seen = Arc::new(Mutex::new(Instant::now()));

    let (mut ws_tx, mut ws_rx) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(CHANNEL_BUFFER_SIZE);

    let writer = tokio::task::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    {
        let mut registry = state.registry.lock().await;
        registry.live.insert(
            my_id.clone(),
            ClientHandle {
                tx: out_tx.clone(),
                session_secret: session_secret.clone(),
                authenticated,
                last_seen: last_seen.clone(),
            },
        );
    }

    let _ = out_tx
        .send(server_text(&ServerMessage::YourId {
            id: my_id.clone(),
            session_secret: session_secret.clone(),
            requires_auth,
        }))
        .await;

    log::info!("client connected id={} remote={:?}", my_id, remote);

    while let Some(result) = ws_rx.next().await {
        let msg = match result {
            Ok(m) => m,
            Err(_) => break,
        };

        if msg.is_pong() {
            *last_seen.lock().await = Instant::now();
            continue;
        }
        if msg.is_close() {
            break;
        }
        if !(msg.is_text() || msg.is_binary()) {
            continue;
        }

        *last_seen.lock().await = Instant::now();

        let frame = match parse_client_frame(msg.as_bytes()) {
            Ok(f) => f,
            Err(e) => {
                // Dropped without a reply: echoing attacker-controlled
                // garbage back is worse than silence.
                log::debug!("dropping malformed frame from {}: {}", my_id, e);
                continue;
            }
        };

        match frame {
            ClientFrame::Control(ClientControl::Authenticate { token }) => {
                match &state.auth_token {
                    Some(expected) if token == **expected => {
                        authenticated = true;
                        let mut registry = state.registry.lock().await;
                        if let Some(handle) = registry.live.get_mut(&my_id) {
                            handle.authenticated = true;
                        }
                        drop(registry);
                        let _ = out_tx.send(server_text(&ServerMessage::Authenticated)).await;
                        log::info!("client {} authenticated", my_id);
                    }
                    Some(_) => {
                        // Unlimited retries; the connection stays open.
                        log::warn!("client {} presented an invalid token", my_id);
                        let _ = out_tx
                            .send(server_text(&ServerMessage::Error {
                                message: "invalid token".to_string(),
                            }))
                            .await;
                    }
                    None => {
                        // Auth disabled; acknowledge so clients that
                        // always authenticate keep working.
                        let _ = out_tx.send(server_text(&ServerMessage::Authenticated)).await;
                    }
                }
            }

            ClientFrame::Control(ClientControl::Reconnect {
                id: old_id,
                session_secret: presented,
            }) => {
                let resumed = {
                    let mut registry = state.registry.lock().await;
                    // Consume-on-success: a second concurrent resume
                    // for the same identity finds no entry. Resumption
                    // is only valid while the identity is not bound to
                    // a live connection.
                    let eligible = !registry.live.contains_key(&old_id)
                        && registry
                            .resumable
                            .get(&old_id)
                            .map(|r| r.session_secret == presented)
                            .unwrap_or(false);
                    let resumed = if eligible {
                        registry.resumable.remove(&old_id)
                    } else {
                        None
                    };
                    if let Some(resumed) = &resumed {
                        // The fresh identity is abandoned; the new
                        // connection adopts the old one atomically.
                        let (tx, seen) = match registry.live.remove(&my_id) {
                            Some(handle) => (handle.tx, handle.last_seen),
                            None => (out_tx.clone(), last_seen.clone()),
                        };
                        registry.live.insert(
                            old_id.clone(),
                            ClientHandle {
                                tx,
                                session_secret: resumed.session_secret.clone(),
                                authenticated: resumed.authenticated,
                                last_seen: seen,
                            },
                        );
                    }
                    resumed
                };

                match resumed {
                    Some(resumed) => {
                        log::info!("client {} resumed identity {}", my_id, old_id);
                        my_id = old_id;
                        authenticated = resumed.authenticated;
                        let _ = out_tx
                            .send(server_text(&ServerMessage::Reconnected {
                                id: my_id.clone(),
                            }))
                            .await;
                    }
                    None => {
                        log::info!("client {} failed to resume identity {}", my_id, old_id);
                        let _ = out_tx.send(server_text(&ServerMessage::ReconnectFailed)).await;
                    }
                }
            }

            ClientFrame::Envelope(mut envelope) => {
                if !authenticated {
                    let _ = out_tx
                        .send(server_text(&ServerMessage::Error {
                            message: "not authenticated".to_string(),
                        }))
                        .await;
                    continue;
                }

                let peer = {
                    let registry = state.registry.lock().await;
                    registry.live.get(envelope.target()).map(|h| h.tx.clone())
                };

                match peer {
                    Some(peer_tx) => {
                        envelope.stamp_from(&my_id);
                        // Fire-and-forget: if the peer's channel is
                        // full the frame is dropped, never queued.
                        if peer_tx.try_send(Message::text(envelope.to_json())).is_err() {
                            log::warn!(
                                "dropping {} frame for {}: channel full",
                                envelope.message_type(),
                                envelope.target()
                            );
                        }
                    }
                    None => {
                        let _ = out_tx
                            .send(server_text(&ServerMessage::Error {
                                message: format!("target {} not found", envelope.target()),
                            }))
                            .await;
                    }
                }
            }
        }
    }

    // Connection closed: free the identity for resumption, unless a
    // heartbeat reclaim or rebind already moved it.
    {
        let mut registry = state.registry.lock().await;
        let ours = registry
            .live
            .get(&my_id)
            .map(|h| h.tx.same_channel(&out_tx))
            .unwrap_or(false);
        if ours {
            if let Some(handle) = registry.live.remove(&my_id) {
                registry.resumable.insert(
                    my_id.clone(),
                    ResumableSession {
                        session_secret: handle.session_secret,
                        authenticated: handle.authenticated,
                    },
                );
            }
        }
    }

    if let Some(addr) = remote {
        let mut per_ip = state.per_ip.lock().await;
        if let Some(count) = per_ip.get_mut(&addr.ip()) {
            *count -= 1;
            if *count == 0 {
                per_ip.remove(&addr.ip());
            }
        }
    }

    writer.abort();
    log::info!("client disconnected id={}", my_id);
}

/// Background task that pings every live connection and reclaims the
/// ones that missed the previous ping.
pub async fn heartbeat_checker(state: Arc<State>) {
    let mut ticker = interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
    loop {
        ticker.tick().await;

        let timeout = Duration::from_secs(HEARTBEAT_INTERVAL_SECS);
        let now = Instant::now();

        let mut dead = Vec::new();
        {
            let registry = state.registry.lock().await;
            for (id, handle) in registry.live.iter() {
                let last = *handle.last_seen.lock().await;
                if now.duration_since(last) > timeout {
                    dead.push(id.clone());
                } else {
                    let _ = handle.tx.try_send(Message::ping(vec![]));
                }
            }
        }

        for id in dead {
            log::warn!("client {} timed out (no heartbeat)", id);
            let mut registry = state.registry.lock().await;
            // remove() makes the reclaim idempotent if the connection
            // task won the race.
            if let Some(handle) = registry.live.remove(&id) {
                let _ = handle.tx.try_send(Message::close());
                registry.resumable.insert(
                    id,
                    ResumableSession {
                        session_secret: handle.session_secret,
                        authenticated: handle.authenticated,
                    },
                );
            }
        }
    }
}
