//! agentrelay server
//!
//! Accepts agent and UI WebSocket connections on `/ws`, keeps a registry of
//! who is connected, supervises agent heartbeats and relays frames between
//! the two roles.

pub mod auth;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod logging;
pub mod registry;
pub mod router;
pub mod state;
pub mod status;
pub mod websocket;

use std::future::Future;
use std::sync::Arc;

use axum::{middleware, routing::get, Router};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::auth_middleware;
use crate::heartbeat::HeartbeatSupervisor;
use crate::state::AppState;
use crate::status::{health_handler, status_handler};
use crate::websocket::ws_handler;

pub fn build_router(state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/status", get(status_handler))
        .route("/health", get(health_handler))
        .with_state(state.clone());

    if let Some(token) = state.config.auth_token.clone() {
        app = app.layer(middleware::from_fn_with_state(token, auth_middleware));
    }

    app.layer(TraceLayer::new_for_http()).layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    )
}

/// Run the relay on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let supervisor = HeartbeatSupervisor::new(state.clone()).spawn();
    let result = axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await;
    supervisor.abort();
    result
}
