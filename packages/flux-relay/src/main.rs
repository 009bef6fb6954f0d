//! Flux Relay
//!
//! A lightweight WebSocket signaling broker for peer-to-peer file transfer.
//! It never sees file bytes: it mints short-lived pairing codes, relays
//! opaque WebRTC offer/answer/ICE payloads between exactly two peers per
//! room, and tracks reconnection locks so a dropped transport can resume
//! without losing its role.

mod error;
mod handler;
mod protocol;
mod state;

use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, State, WebSocketUpgrade},
    http::Method,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use clap::Parser;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use state::{RelayConfig, RelayState};

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "flux-relay", version, about = "Flux P2P file transfer signaling broker")]
struct Args {
    /// Address to bind on.
    #[arg(long, default_value = "0.0.0.0", env = "FLUX_HOST")]
    host: String,

    /// Port to listen on.
    #[arg(short, long, default_value_t = 8080, env = "FLUX_PORT")]
    port: u16,

    /// Lifetime of a generated pairing code, in seconds.
    #[arg(long, default_value_t = 300, env = "FLUX_CODE_TTL_SECS")]
    code_ttl_secs: i64,

    /// Lifetime of a reconnection lock, in seconds.
    #[arg(long, default_value_t = 300, env = "FLUX_LOCK_TTL_SECS")]
    lock_ttl_secs: i64,

    /// Width of the rolling rate-limit window, in seconds.
    #[arg(long, default_value_t = 60, env = "FLUX_RATE_WINDOW_SECS")]
    rate_window_secs: i64,

    /// Maximum `join_room` attempts per client within the rate window.
    #[arg(long, default_value_t = 10, env = "FLUX_RATE_LIMIT")]
    rate_limit: u32,

    /// Consecutive invalid-code failures before a client is locked out.
    #[arg(long, default_value_t = 3, env = "FLUX_LOCKOUT_THRESHOLD")]
    lockout_threshold: u32,

    /// Lockout duration, in seconds.
    #[arg(long, default_value_t = 300, env = "FLUX_LOCKOUT_SECS")]
    lockout_secs: i64,

    /// Interval between expired-code sweeps, in seconds.
    #[arg(long, default_value_t = 30, env = "FLUX_CLEANUP_INTERVAL_SECS")]
    cleanup_interval_secs: u64,
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flux_relay=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();

    let config = RelayConfig {
        host: args.host,
        port: args.port,
        code_ttl_secs: args.code_ttl_secs,
        lock_ttl_secs: args.lock_ttl_secs,
        rate_window_secs: args.rate_window_secs,
        rate_limit: args.rate_limit,
        lockout_threshold: args.lockout_threshold,
        lockout_secs: args.lockout_secs,
        cleanup_interval_secs: args.cleanup_interval_secs,
    };

    let state = RelayState::new(config);

    let cleanup_state = state.clone();
    let cleanup_interval = state.config.cleanup_interval_secs;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(cleanup_interval));
        loop {
            interval.tick().await;
            cleanup_state.cleanup_expired();
        }
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST]);

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let addr: SocketAddr = format!("{}:{}", state.config.host, state.config.port)
        .parse()
        .expect("invalid host/port");

    tracing::info!(%addr, "flux-relay listening");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("server error");
}

// ── Route Handlers ────────────────────────────────────────────────────────────

/// WebSocket upgrade handler for client connections. The peer's socket
/// address is used as the abuse-control rate-limit key.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<RelayState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handler::handle_websocket(socket, state, addr.ip().to_string()))
}

/// Health check endpoint.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "flux-relay",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Statistics endpoint.
async fn stats_handler(State(state): State<RelayState>) -> impl IntoResponse {
    Json(json!({
        "service": "flux-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "connected_clients": state.connections.len(),
    }))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
