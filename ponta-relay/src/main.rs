use std::net::SocketAddr;
use std::sync::Arc;

use ponta_relay::{heartbeat_checker, routes, State, DEFAULT_MAX_CONNS_PER_IP};

#[tokio::main]
async fn main() {
    env_logger::init();

    let listen: SocketAddr = std::env::var("PONTA_RELAY_LISTEN")
        .unwrap_or_else(|_| "0.0.0.0:9595".to_string())
        .parse()
        .expect("invalid PONTA_RELAY_LISTEN (expected host:port)");

    let auth_token = match std::env::var("PONTA_RELAY_TOKEN") {
        Ok(s) if !s.trim().is_empty() => Some(Arc::new(s)),
        _ => {
            log::warn!("PONTA_RELAY_TOKEN not set; accepting unauthenticated clients");
            None
        }
    };

    let max_conns_per_ip = std::env::var("PONTA_RELAY_MAX_CONNS_PER_IP")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_MAX_CONNS_PER_IP);

    // Compression over relayed ciphertext leaks plaintext length
    // structure (compression oracle), so the toggle is never honored.
    if matches!(
        std::env::var("PONTA_RELAY_COMPRESSION").as_deref(),
        Ok("1") | Ok("true")
    ) {
        log::warn!("PONTA_RELAY_COMPRESSION requested but compression stays disabled");
    }

    let state = Arc::new(State {
        auth_token,
        max_conns_per_ip,
        ..State::default()
    });

    tokio::spawn(heartbeat_checker(state.clone()));

    log::info!(
        "ponta-relay listening on {} (max {} connections per address)",
        listen,
        max_conns_per_ip
    );
    warp::serve(routes(state)).run(listen).await;
}
