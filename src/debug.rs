//! The `--debug` stats endpoint.
//!
//! A single localhost JSON route reporting runtime counts; nothing here
//! may expose per-client state.
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tracing::{info, warn};

use crate::irc::server::Server;
use crate::util::now_unix;

#[derive(Serialize)]
struct StatsReport {
    clients: usize,
    channels: usize,
    uptime_seconds: i64,
}

fn router(server: Arc<Server>) -> Router {
    Router::new().route("/stats", get(stats)).with_state(server)
}

async fn stats(State(server): State<Arc<Server>>) -> Json<StatsReport> {
    let st = server.state.read().await;
    Json(StatsReport {
        clients: st.clients.len(),
        channels: st.channels.len(),
        uptime_seconds: now_unix() - server.created,
    })
}

/// Serve the stats route on localhost only.
pub async fn serve(server: Arc<Server>, port: u16) {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => {
            info!("debug endpoint on http://{addr}/stats");
            if let Err(err) = axum::serve(listener, router(server)).await {
                warn!("debug endpoint error: {err}");
            }
        }
        Err(err) => warn!("failed to bind debug endpoint on {addr}: {err}"),
    }
}
