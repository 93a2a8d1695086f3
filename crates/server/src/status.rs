//! HTTP status endpoints

use std::sync::Arc;

use agentrelay_protocol::StatusReport;
use axum::{extract::State, Json};
use tokio::time::Instant;

use crate::state::AppState;

/// `GET /status`: liveness of every agent seen by this process
pub async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusReport> {
    Json(
        state
            .registry
            .status_report(Instant::now(), &state.config.heartbeat),
    )
}

pub async fn health_handler() -> &'static str {
    "OK"
}
