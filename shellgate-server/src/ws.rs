//! WebSocket transport for PTY sessions.
//!
//! The socket is split: one task drains the session's outbound frames into
//! the socket, the other feeds inbound frames to the broker. Whichever ends
//! first takes the other down, then the transport is detached.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use shellgate_core::{transport_channel, Outbound};
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::AppState;

pub async fn session_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Response, ApiError> {
    // Reject unknown ids before upgrading so the client gets a 404.
    state.pty.geometry(&session_id)?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, session_id)))
}

async fn handle_socket(socket: WebSocket, state: AppState, session_id: String) {
    let (handle, mut outbound) = transport_channel();
    let transport_id = handle.id();
    let replies = handle.clone();

    if let Err(e) = state.pty.attach(&session_id, handle) {
        debug!(session_id = %session_id, error = %e, "Attach failed, closing socket");
        let mut socket = socket;
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    let (mut sender, mut receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            match frame {
                Outbound::Message(msg) => {
                    let text = match msg.to_json() {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "Dropping unserializable frame");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    let pty = state.pty.clone();
    let id = session_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            let result = match msg {
                Message::Text(text) => pty
                    .handle_client_message(&id, text.as_str())
                    .map(|reply| {
                        if let Some(reply) = reply {
                            replies.send(reply);
                        }
                    }),
                Message::Binary(bytes) => pty.write(&id, &bytes),
                Message::Close(_) => break,
                _ => Ok(()),
            };

            if let Err(e) = result {
                if e.is_not_found() {
                    break;
                }
                warn!(session_id = %id, "Rejected client frame: {}", e);
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.pty.detach(&session_id, transport_id);
    debug!(session_id = %session_id, transport = transport_id, "WebSocket closed");
}
