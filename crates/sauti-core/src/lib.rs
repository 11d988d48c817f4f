//! Sauti Core - Voice Relay Response Pipeline
//!
//! This crate implements the audio response pipeline for the Sauti voice
//! relay: accumulating audio fragments streamed by an upstream
//! conversational engine, detecting turn completion, re-segmenting each
//! response into delivery units sized for smooth playback, fanning units
//! out across parallel delivery lanes, and honoring user interruptions
//! immediately and consistently.
//!
//! # Architecture
//!
//! Forward flow:
//!
//! ```text
//! upstream fragments -> Accumulator -> CompleteResponse
//!                    -> chunk scheduler -> delivery lanes -> EventSink
//! ```
//!
//! The interruption path can cut in at any stage; a per-conversation
//! generation counter invalidates every stale continuation.
//!
//! # Example
//!
//! ```ignore
//! use sauti_core::{DeliveryConfig, Relay};
//!
//! let relay = Arc::new(Relay::new(DeliveryConfig::default(), sink, upstream)?);
//! relay.on_fragment("conv-1", None, fragment_bytes);
//! relay.interrupt("conv-1").await?;
//! ```

pub mod audio;
pub mod config;
pub mod delivery;
pub mod error;
pub mod relay;
pub mod sink;
pub mod turn;

pub use config::{DeliveryConfig, PcmFormat};
pub use delivery::{DeliveryOutcome, DeliveryUnit};
pub use error::{Error, Result};
pub use relay::{Conversation, ConversationSnapshot, Relay, TurnPhase};
pub use sink::{EventSink, UpstreamEngine, UpstreamEvent};
pub use turn::{AudioFragment, CompleteResponse, PendingResponse};
