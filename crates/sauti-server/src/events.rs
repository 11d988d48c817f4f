//! WebSocket wire protocol and the event-sink adapter
//!
//! [`WsEventRouter`] is the transport-side implementation of the core's
//! `EventSink`: it maps a conversation id to the mpsc sender feeding that
//! connection's write loop. Audio payloads travel base64-encoded inside
//! JSON text frames so every event is self-describing.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use sauti_core::{DeliveryUnit, Error, EventSink, Result};

/// Events sent to the client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    SessionStarted {
        session_id: String,
    },
    AudioChunk {
        session_id: String,
        chunk_index: usize,
        total_chunks: usize,
        is_last_chunk: bool,
        lane_id: usize,
        audio_data: String,
    },
    AudioComplete {
        session_id: String,
        total_chunks: usize,
    },
    TextResponse {
        session_id: String,
        text: String,
    },
    InterruptionConfirmed {
        session_id: String,
        upstream_acknowledged: bool,
    },
    Error {
        message: String,
    },
}

/// Messages received from the client. Binary frames carry raw audio input
/// and bypass this enum.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Start {
        #[serde(default)]
        session_id: Option<String>,
    },
    Input {
        text: String,
    },
    StopSpeaking,
    Interrupt,
    End,
}

/// Routes core events to the WebSocket connection owning each session.
#[derive(Default)]
pub struct WsEventRouter {
    routes: Mutex<HashMap<String, mpsc::Sender<ServerEvent>>>,
}

impl WsEventRouter {
    pub fn register(&self, session_id: &str, tx: mpsc::Sender<ServerEvent>) {
        self.routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session_id.to_string(), tx);
    }

    pub fn deregister(&self, session_id: &str) {
        self.routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);
        debug!(session_id, "WebSocket route removed");
    }

    fn push(&self, session_id: &str, event: ServerEvent) -> Result<()> {
        let tx = self
            .routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .cloned()
            .ok_or_else(|| {
                Error::DeliveryTransport(format!("no active connection for {}", session_id))
            })?;
        tx.try_send(event)
            .map_err(|e| Error::DeliveryTransport(format!("connection backlogged: {}", e)))
    }
}

#[async_trait]
impl EventSink for WsEventRouter {
    async fn audio_chunk(&self, conversation_id: &str, unit: &DeliveryUnit) -> Result<()> {
        self.push(
            conversation_id,
            ServerEvent::AudioChunk {
                session_id: conversation_id.to_string(),
                chunk_index: unit.index,
                total_chunks: unit.total_units,
                is_last_chunk: unit.is_last,
                lane_id: unit.lane,
                audio_data: BASE64.encode(&unit.payload),
            },
        )
    }

    async fn audio_complete(&self, conversation_id: &str, total_units: usize) -> Result<()> {
        self.push(
            conversation_id,
            ServerEvent::AudioComplete {
                session_id: conversation_id.to_string(),
                total_chunks: total_units,
            },
        )
    }

    async fn text_ready(&self, conversation_id: &str, text: &str) -> Result<()> {
        self.push(
            conversation_id,
            ServerEvent::TextResponse {
                session_id: conversation_id.to_string(),
                text: text.to_string(),
            },
        )
    }

    async fn interruption_confirmed(
        &self,
        conversation_id: &str,
        upstream_acknowledged: bool,
    ) -> Result<()> {
        self.push(
            conversation_id,
            ServerEvent::InterruptionConfirmed {
                session_id: conversation_id.to_string(),
                upstream_acknowledged,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn unit() -> DeliveryUnit {
        DeliveryUnit {
            payload: Bytes::from_static(b"abc"),
            index: 0,
            total_units: 1,
            is_last: true,
            lane: 0,
        }
    }

    #[tokio::test]
    async fn routes_events_to_registered_session() {
        let router = WsEventRouter::default();
        let (tx, mut rx) = mpsc::channel(4);
        router.register("s1", tx);

        router.audio_chunk("s1", &unit()).await.unwrap();
        match rx.recv().await.unwrap() {
            ServerEvent::AudioChunk {
                audio_data,
                is_last_chunk,
                ..
            } => {
                assert_eq!(audio_data, BASE64.encode(b"abc"));
                assert!(is_last_chunk);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn unknown_session_is_a_transport_error() {
        let router = WsEventRouter::default();
        let err = router.audio_complete("ghost", 1).await.unwrap_err();
        assert!(matches!(err, Error::DeliveryTransport(_)));
    }

    #[test]
    fn client_message_wire_format() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"input","text":"hi"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Input { text } if text == "hi"));

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"stop-speaking"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::StopSpeaking));
    }

    #[test]
    fn server_event_wire_format() {
        let json = serde_json::to_string(&ServerEvent::AudioComplete {
            session_id: "s1".into(),
            total_chunks: 3,
        })
        .unwrap();
        assert!(json.contains(r#""type":"audio-complete""#));
        assert!(json.contains(r#""total_chunks":3"#));
    }
}
