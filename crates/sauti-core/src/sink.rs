//! Boundary traits: client event sink and upstream engine
//!
//! The relay core never touches a socket. The transport adapter implements
//! [`EventSink`] and is injected at construction; the upstream engine is
//! behind [`UpstreamEngine`] and feeds events back in through
//! [`crate::relay::Relay::on_upstream_event`].

use async_trait::async_trait;
use bytes::Bytes;

use crate::delivery::DeliveryUnit;
use crate::error::Result;

/// Events the relay emits toward the client transport.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// One delivery unit of synthesized audio.
    async fn audio_chunk(&self, conversation_id: &str, unit: &DeliveryUnit) -> Result<()>;

    /// All units of a response have been transmitted.
    async fn audio_complete(&self, conversation_id: &str, total_units: usize) -> Result<()>;

    /// A text response is available alongside (or instead of) audio.
    async fn text_ready(&self, conversation_id: &str, text: &str) -> Result<()>;

    /// The interruption took local effect. `upstream_acknowledged` reports
    /// whether the upstream engine also confirmed it.
    async fn interruption_confirmed(
        &self,
        conversation_id: &str,
        upstream_acknowledged: bool,
    ) -> Result<()>;
}

/// Imperative calls toward the upstream conversational engine.
#[async_trait]
pub trait UpstreamEngine: Send + Sync {
    async fn send_text(&self, conversation_id: &str, text: &str) -> Result<()>;

    async fn send_audio(&self, conversation_id: &str, audio: Bytes) -> Result<()>;

    /// The user finished speaking; the engine may start its turn.
    async fn end_of_input(&self, _conversation_id: &str) -> Result<()> {
        Ok(())
    }

    async fn interrupt(&self, conversation_id: &str) -> Result<()>;
}

/// One streaming callback event from the upstream engine.
///
/// Fields arrive in arbitrary combinations: audio-only fragments, text-only
/// responses, or a bare interruption flag.
#[derive(Debug, Clone, Default)]
pub struct UpstreamEvent {
    pub conversation_id: String,
    pub turn_id: Option<String>,
    pub audio: Option<Bytes>,
    pub text: Option<String>,
    pub interrupted: bool,
}
