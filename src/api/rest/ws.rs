use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use futures::SinkExt;
use futures::StreamExt;
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::realtime::{ClientEvent, Connection};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct HandshakeParams {
    pub token: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HandshakeParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let token = params.token.unwrap_or_default();
    match state.hub.connect(&token) {
        Ok(connection) => ws
            .on_upgrade(move |socket| handle_socket(socket, state, connection))
            .into_response(),
        Err(err) => {
            warn!(error = %err, "websocket handshake rejected");
            err.into_response()
        }
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, connection: Connection) {
    let connection_id = connection.id;
    let (mut sender, mut receiver) = socket.split();
    let mut events = ReceiverStream::new(connection.events);

    let send_task = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(err) => {
                    warn!(error = %err, "failed to serialize event for ws");
                    continue;
                }
            };

            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    let hub_state = state.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => hub_state.hub.handle(connection_id, event).await,
                    Err(err) => hub_state
                        .hub
                        .reject_frame(connection_id, format!("malformed event: {err}")),
                },
                Message::Close(_) => break,
                _ => debug!(connection_id = %connection_id, "ignoring non-text frame"),
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    state.hub.disconnect(connection_id);
}
