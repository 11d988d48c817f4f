//! Per-turn response data model
//!
//! Fragments arrive from the upstream engine in bursts of arbitrary size
//! and timing. They are collected into a [`PendingResponse`] until the turn
//! is judged complete, then merged into an immutable [`CompleteResponse`]
//! carrying one container header and the concatenated sample data.

use bytes::Bytes;
use tokio::time::Instant;
use tracing::warn;

use crate::audio::{container, ContainerHeader};
use crate::config::PcmFormat;
use crate::error::Result;

/// One burst of audio bytes emitted by the upstream engine.
#[derive(Debug, Clone)]
pub struct AudioFragment {
    pub bytes: Bytes,
    pub received_at: Instant,
}

impl AudioFragment {
    pub fn new(bytes: Bytes) -> Self {
        Self {
            bytes,
            received_at: Instant::now(),
        }
    }
}

/// Fragments accumulated for one in-progress turn, ordered by arrival.
#[derive(Debug)]
pub struct PendingResponse {
    pub turn_id: String,
    fragments: Vec<AudioFragment>,
    pub first_fragment_at: Instant,
    pub last_fragment_at: Instant,
}

impl PendingResponse {
    pub fn new(turn_id: impl Into<String>, fragment: AudioFragment) -> Self {
        let at = fragment.received_at;
        Self {
            turn_id: turn_id.into(),
            fragments: vec![fragment],
            first_fragment_at: at,
            last_fragment_at: at,
        }
    }

    pub fn push(&mut self, fragment: AudioFragment) {
        self.last_fragment_at = fragment.received_at;
        self.fragments.push(fragment);
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    pub fn byte_len(&self) -> usize {
        self.fragments.iter().map(|f| f.bytes.len()).sum()
    }

    /// Merge all fragments into one complete response.
    ///
    /// The first fragment's container header (when present) becomes the
    /// response header; every fragment contributes only its raw sample
    /// region. Fragments that look like containers but fail to parse are
    /// appended as raw PCM rather than dropped.
    pub fn merge(self, fallback: PcmFormat) -> Result<CompleteResponse> {
        let header = self
            .fragments
            .first()
            .filter(|f| container::is_container(&f.bytes))
            .and_then(|f| container::unwrap(&f.bytes).ok().map(|(h, _)| h));

        let mut raw = Vec::with_capacity(self.byte_len());
        for fragment in &self.fragments {
            if container::is_container(&fragment.bytes) {
                match container::unwrap(&fragment.bytes) {
                    Ok((_, samples)) => raw.extend_from_slice(samples),
                    Err(e) => {
                        warn!(turn_id = %self.turn_id, "Fragment with broken header treated as raw PCM: {}", e);
                        raw.extend_from_slice(&fragment.bytes);
                    }
                }
            } else {
                raw.extend_from_slice(&fragment.bytes);
            }
        }

        Ok(match header {
            Some(header) => CompleteResponse {
                turn_id: self.turn_id,
                format: header.format(),
                payload: Bytes::from(container::reheader(&raw, &header)),
                header: Some(header),
            },
            None => CompleteResponse {
                turn_id: self.turn_id,
                format: fallback,
                payload: Bytes::from(raw),
                header: None,
            },
        })
    }
}

/// A merged, immutable response ready for chunking and delivery.
#[derive(Debug, Clone)]
pub struct CompleteResponse {
    pub turn_id: String,
    /// Full container bytes, or bare raw PCM when no header was present.
    pub payload: Bytes,
    pub format: PcmFormat,
    pub header: Option<ContainerHeader>,
}

impl CompleteResponse {
    /// Build a response directly from container bytes (fallback tone path).
    pub fn from_container(turn_id: impl Into<String>, payload: Vec<u8>) -> Result<Self> {
        let (header, _) = container::unwrap(&payload)?;
        Ok(Self {
            turn_id: turn_id.into(),
            format: header.format(),
            payload: Bytes::from(payload),
            header: Some(header),
        })
    }

    /// The raw sample region, header excluded.
    pub fn raw_samples(&self) -> &[u8] {
        if self.header.is_some() {
            &self.payload[container::HEADER_LEN..]
        } else {
            &self.payload
        }
    }

    /// Estimated playback duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        let bps = self.format.bytes_per_second();
        if bps == 0 {
            return 0.0;
        }
        self.raw_samples().len() as f64 / bps as f64
    }
}
