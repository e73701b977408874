use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::protocol::{ClientMessage, ConnectionId, ServerMessage};
use crate::registry::{Directory, Registration};
use crate::server::AppState;

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, remote_addr))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, remote_addr: SocketAddr) {
    let Registration {
        connection_id,
        mut receiver,
    } = state.registry.register();
    let (mut sender, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(message) = receiver.recv().await {
            let json = match message.to_json() {
                Ok(json) => json,
                Err(err) => {
                    warn!(connection_id = %connection_id, error = %err, "failed to encode message");
                    continue;
                }
            };
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        debug!(connection_id = %connection_id, "writer task finished");
    });

    info!(
        connection_id = %connection_id,
        remote_addr = %remote_addr,
        "connection established"
    );
    state.switchboard.connect(connection_id);

    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                warn!(connection_id = %connection_id, error = %err, "error receiving frame");
                break;
            }
        };

        match frame {
            Message::Text(text) => handle_text(&state, connection_id, &text),
            Message::Binary(data) => match std::str::from_utf8(&data) {
                // Some clients send JSON in binary frames.
                Ok(text) => handle_text(&state, connection_id, text),
                Err(_) => debug!(
                    connection_id = %connection_id,
                    len = data.len(),
                    "ignoring non-UTF-8 binary frame"
                ),
            },
            Message::Close(frame) => {
                debug!(
                    connection_id = %connection_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    // Unregister before telling the switchboard, so a concurrent match request
    // already sees this connection as gone.
    state.registry.unregister(connection_id);
    let departure = state.switchboard.disconnect(connection_id);
    writer.abort();

    info!(
        connection_id = %connection_id,
        was_queued = departure.was_queued,
        room_id = ?departure.session.as_ref().map(|s| s.room_id.as_str()),
        "connection closed"
    );
}

fn handle_text(state: &AppState, connection_id: ConnectionId, text: &str) {
    match ClientMessage::parse(text) {
        Ok(ClientMessage::FindMatch) => {
            state.switchboard.request_match(connection_id);
        }
        Ok(ClientMessage::Signal { room_id, envelope }) => {
            // Drops are logged by the switchboard and never echoed to the sender.
            let _ = state.switchboard.route(&room_id, connection_id, envelope);
        }
        Ok(ClientMessage::Ping) => {
            state.registry.deliver(connection_id, ServerMessage::Pong);
        }
        Err(err) => {
            warn!(connection_id = %connection_id, error = %err, "invalid client message");
            state.registry.deliver(
                connection_id,
                ServerMessage::Error {
                    message: err.to_string(),
                },
            );
        }
    }
}
