//! Error types for the Sauti relay core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Malformed audio container: {0}")]
    MalformedAudio(String),

    #[error("Delivery transport error: {0}")]
    DeliveryTransport(String),

    #[error("Upstream engine disconnected: {0}")]
    UpstreamDisconnected(String),

    #[error("Unknown conversation: {0}")]
    ConversationNotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Audio encoding error: {0}")]
    AudioError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<hound::Error> for Error {
    fn from(e: hound::Error) -> Self {
        Error::AudioError(e.to_string())
    }
}
