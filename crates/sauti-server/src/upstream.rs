//! HTTP client for the upstream conversational engine
//!
//! Input calls return as soon as the engine accepts them; the streamed
//! response body is pumped into [`UpstreamSignal`]s on a background task so
//! the relay sees fragments with the same burst timing the engine produced
//! them.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use sauti_core::{Error, Result, UpstreamEngine, UpstreamEvent};

use crate::settings::UpstreamSettings;

/// What the streaming pump reports back to the relay.
#[derive(Debug)]
pub enum UpstreamSignal {
    Event(UpstreamEvent),
    Disconnected { conversation_id: String },
}

pub struct HttpUpstream {
    client: reqwest::Client,
    base_url: String,
    tx: mpsc::Sender<UpstreamSignal>,
}

impl HttpUpstream {
    pub fn new(settings: &UpstreamSettings) -> Result<(Self, mpsc::Receiver<UpstreamSignal>)> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .map_err(|e| Error::ConfigError(format!("upstream client: {}", e)))?;
        let (tx, rx) = mpsc::channel(256);
        Ok((
            Self {
                client,
                base_url: settings.base_url.trim_end_matches('/').to_string(),
                tx,
            },
            rx,
        ))
    }

    fn url(&self, conversation_id: &str, action: &str) -> String {
        format!("{}/conversations/{}/{}", self.base_url, conversation_id, action)
    }

    /// Send a request and stream the response body into fragment events.
    async fn dispatch(&self, conversation_id: &str, request: reqwest::RequestBuilder) -> Result<()> {
        let response = request
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::UpstreamDisconnected(e.to_string()))?;

        let tx = self.tx.clone();
        let id = conversation_id.to_string();
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            while let Some(next) = stream.next().await {
                match next {
                    Ok(chunk) if chunk.is_empty() => continue,
                    Ok(chunk) => {
                        debug!(conversation_id = %id, bytes = chunk.len(), "Upstream fragment");
                        let event = UpstreamEvent {
                            conversation_id: id.clone(),
                            turn_id: None,
                            audio: Some(chunk),
                            text: None,
                            interrupted: false,
                        };
                        if tx.send(UpstreamSignal::Event(event)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(conversation_id = %id, "Upstream stream broke: {}", e);
                        let _ = tx
                            .send(UpstreamSignal::Disconnected {
                                conversation_id: id,
                            })
                            .await;
                        return;
                    }
                }
            }
        });
        Ok(())
    }
}

#[async_trait]
impl UpstreamEngine for HttpUpstream {
    async fn send_text(&self, conversation_id: &str, text: &str) -> Result<()> {
        let request = self
            .client
            .post(self.url(conversation_id, "input"))
            .json(&serde_json::json!({ "text": text }));
        self.dispatch(conversation_id, request).await
    }

    async fn send_audio(&self, conversation_id: &str, audio: Bytes) -> Result<()> {
        let request = self
            .client
            .post(self.url(conversation_id, "audio"))
            .header("content-type", "application/octet-stream")
            .body(audio);
        self.dispatch(conversation_id, request).await
    }

    async fn end_of_input(&self, conversation_id: &str) -> Result<()> {
        let request = self.client.post(self.url(conversation_id, "commit"));
        self.dispatch(conversation_id, request).await
    }

    async fn interrupt(&self, conversation_id: &str) -> Result<()> {
        self.client
            .post(self.url(conversation_id, "interrupt"))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::UpstreamDisconnected(e.to_string()))?;
        Ok(())
    }
}
