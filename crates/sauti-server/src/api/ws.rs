//! WebSocket endpoint: one connection per conversation
//!
//! The socket is split into a read loop (client messages into the relay)
//! and a write loop (relay events out). The write loop is fed by the
//! session's mpsc route registered in [`WsEventRouter`]; closing the
//! connection deregisters the route and ends the conversation.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::{ClientMessage, ServerEvent};
use crate::state::AppState;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut session_id = Uuid::new_v4().to_string();
    let (event_tx, mut event_rx) = mpsc::channel::<ServerEvent>(256);

    state.routes.register(&session_id, event_tx.clone());
    state.relay.start_conversation(&session_id);
    info!(session_id, "WebSocket connected");

    let _ = event_tx.try_send(ServerEvent::SessionStarted {
        session_id: session_id.clone(),
    });

    let writer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(text) => {
                    if ws_tx.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Failed to serialize server event: {}", e),
            }
        }
    });

    while let Some(Ok(message)) = ws_rx.next().await {
        match message {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(msg) => {
                    if !handle_client_message(&state, &mut session_id, &event_tx, msg).await {
                        break;
                    }
                }
                Err(e) => {
                    debug!(session_id, "Unparseable client message: {}", e);
                    let _ = event_tx.try_send(ServerEvent::Error {
                        message: format!("invalid message: {}", e),
                    });
                }
            },
            Message::Binary(data) => {
                // Raw audio input; upstream failures already surface as a
                // fallback response, so only log here.
                if let Err(e) = state
                    .relay
                    .send_audio_input(&session_id, Bytes::from(data))
                    .await
                {
                    debug!(session_id, "Audio input rejected: {}", e);
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.routes.deregister(&session_id);
    state.relay.end_conversation(&session_id);
    writer.abort();
    info!(session_id, "WebSocket closed");
}

/// Dispatch one parsed client message. Returns false when the connection
/// should close.
async fn handle_client_message(
    state: &AppState,
    session_id: &mut String,
    event_tx: &mpsc::Sender<ServerEvent>,
    msg: ClientMessage,
) -> bool {
    match msg {
        ClientMessage::Start {
            session_id: requested,
        } => {
            // A client may adopt its own session id (reconnection); move the
            // event route over before announcing it.
            if let Some(new_id) = requested {
                if new_id != *session_id {
                    state.routes.register(&new_id, event_tx.clone());
                    state.routes.deregister(session_id);
                    state.relay.end_conversation(session_id);
                    state.relay.start_conversation(&new_id);
                    *session_id = new_id;
                }
            }
            let _ = event_tx.try_send(ServerEvent::SessionStarted {
                session_id: session_id.clone(),
            });
            true
        }
        ClientMessage::Input { text } => {
            if let Err(e) = state.relay.send_text_input(session_id, &text).await {
                debug!(session_id = %session_id, "Text input rejected: {}", e);
            }
            true
        }
        ClientMessage::StopSpeaking => {
            if let Err(e) = state.relay.finish_user_turn(session_id).await {
                warn!(session_id = %session_id, "Turn-end signal failed: {}", e);
            }
            true
        }
        ClientMessage::Interrupt => {
            if let Err(e) = state.relay.interrupt(session_id).await {
                warn!(session_id = %session_id, "Interrupt failed: {}", e);
            }
            true
        }
        ClientMessage::End => false,
    }
}
