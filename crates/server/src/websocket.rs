//! WebSocket handling

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::registry::Outbound;
use crate::router::{connection_closed, handle_text, ConnectionContext};
use crate::state::AppState;

static NEXT_CONNECTION_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Per-socket outbound queue. Broadcasts never wait on it.
const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let serial = NEXT_CONNECTION_SERIAL.fetch_add(1, Ordering::Relaxed);
    info!(
        component = "websocket",
        event = "ws.connection.opened",
        serial,
        "WebSocket connection opened"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(OUTBOUND_QUEUE_CAPACITY);

    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let result = match msg {
                Outbound::Text(text) => ws_tx.send(Message::Text(text.into())).await,
                Outbound::Pong(data) => ws_tx.send(Message::Pong(data)).await,
                Outbound::Close { code, reason } => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            };

            if result.is_err() {
                debug!(
                    component = "websocket",
                    event = "ws.send.disconnected",
                    serial,
                    "WebSocket send failed, peer disconnected"
                );
                break;
            }
        }
    });

    let mut ctx = ConnectionContext::new(serial, outbound_tx.clone());

    loop {
        tokio::select! {
            incoming = ws_rx.next() => {
                let Some(result) = incoming else { break };
                match result {
                    Ok(Message::Text(text)) => handle_text(&state, &mut ctx, text.as_str()),
                    Ok(Message::Ping(data)) => {
                        let _ = outbound_tx.try_send(Outbound::Pong(data));
                    }
                    Ok(Message::Close(frame)) => {
                        info!(
                            component = "websocket",
                            event = "ws.connection.close_frame",
                            serial,
                            code = frame.as_ref().map(|f| f.code),
                            "Peer sent close frame"
                        );
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(
                            component = "websocket",
                            event = "ws.connection.error",
                            serial,
                            error = %e,
                            "WebSocket error"
                        );
                        break;
                    }
                }
            }
            // Writer finished: we closed the socket (eviction) or the peer is gone
            _ = &mut send_task => break,
        }
    }

    connection_closed(&state, &mut ctx);
    info!(
        component = "websocket",
        event = "ws.connection.closed",
        serial,
        "WebSocket connection closed"
    );
    send_task.abort();
}
