use crate::state::AppState;
use crate::ws::signaling::SignalingSession;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use relay_protocol::{ConnectionId, ServerMessage, Welcome};
use tokio::sync::mpsc;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let connection_id = ConnectionId::new();

    // Create channel for outbound messages
    let (tx, mut rx) = mpsc::channel::<String>(state.config.signaling.outbound_queue.max(1));

    // The greeting goes out before any broadcast can reach this connection
    let welcome = ServerMessage::Welcome(Welcome { connection_id });
    match serde_json::to_string(&welcome) {
        Ok(json) => {
            if tx.send(json).await.is_err() {
                return;
            }
        }
        Err(e) => {
            tracing::error!("Failed to serialize welcome: {}", e);
            return;
        }
    }

    state.connections.add_connection(connection_id, tx).await;
    tracing::info!(
        "Connection {} opened ({} connected)",
        connection_id,
        state.connections.connection_count().await
    );

    // Spawn task to forward messages from channel to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    let mut session = SignalingSession::new(connection_id, &state);

    // Frames of one connection are handled strictly in order
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if let Some(reply) = session.handle_frame(text.as_str()).await {
                    state.connections.send_to_connection(connection_id, &reply).await;
                }
            }
            Ok(Message::Binary(data)) => {
                tracing::warn!(
                    "Dropped {} byte binary frame from {}",
                    data.len(),
                    connection_id
                );
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::warn!("WebSocket error on connection {}: {}", connection_id, e);
                break;
            }
            _ => {}
        }
    }

    // Leave the broadcast set before releasing anything
    state.connections.remove_connection(connection_id).await;
    session.close().await;

    // Abort the send task
    send_task.abort();

    tracing::info!(
        "Connection {} closed ({} producers live)",
        connection_id,
        state.registry.producer_count().await
    );
}
