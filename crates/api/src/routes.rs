use crate::hub::Outbound;
use crate::state::AppState;
use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use coinpulse_core::{ConnectionId, ControlMessage};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(health_check))
}

pub fn ws_routes() -> Router<Arc<AppState>> {
    Router::new().route("/ws", get(ws_upgrade))
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let uptime = chrono::Utc::now() - state.started_at;
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": uptime.num_seconds(),
        "connections": state.hub.connection_count(),
        "active_topics": state.hub.active_topics(),
        "topics": state.config.topics.keys().collect::<Vec<_>>(),
        "cache_entries": state.cache.len(),
    }))
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Bridge one socket to the hub until either side closes.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (id, mut outbound) = state.hub.connect();
    let (mut sink, mut stream) = socket.split();
    info!(connection = %id, "WebSocket connection established");

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => handle_control(&state, id, text.as_str()),
                Some(Ok(Message::Pong(_))) => state.hub.heartbeat_ack(id),
                Some(Ok(Message::Close(_))) | None => {
                    debug!(connection = %id, "Client closed");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(connection = %id, error = %e, "WebSocket error");
                    break;
                }
            },
            frame = outbound.recv() => match frame {
                Some(Outbound::Message(msg)) => {
                    let json = match serde_json::to_string(&msg) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!(connection = %id, error = %e, "Failed to encode message");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(json.into())).await {
                        warn!(connection = %id, error = %e, "Failed to send message");
                        break;
                    }
                }
                Some(Outbound::Ping) => {
                    if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
        }
    }

    state.hub.disconnect(id);
    info!(connection = %id, "WebSocket connection closed");
}

fn handle_control(state: &AppState, id: ConnectionId, text: &str) {
    match serde_json::from_str::<ControlMessage>(text) {
        Ok(ControlMessage::Subscribe { topic }) => {
            if let Err(e) = state.hub.subscribe(id, &topic) {
                debug!(connection = %id, topic = %topic, error = %e, "Subscribe rejected");
            }
        }
        Ok(ControlMessage::Unsubscribe { topic }) => state.hub.unsubscribe(id, &topic),
        Err(e) => warn!(connection = %id, error = %e, "Ignoring malformed control message"),
    }
}
