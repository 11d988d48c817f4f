//! Minimal fixed-header PCM container codec
//!
//! The relay passes synthesized speech around as standard 44-byte-header
//! WAV data. Units sliced out of a response are re-wrapped with their own
//! corrected header so every delivery unit is independently playable.
//! Only the two size fields are ever recomputed; all other header bytes
//! are carried over verbatim from the source container.

use crate::config::PcmFormat;
use crate::error::{Error, Result};

/// Byte length of the minimal header: RIFF descriptor + fmt chunk + data
/// chunk preamble.
pub const HEADER_LEN: usize = 44;

const RIFF_SIZE_OFFSET: usize = 4;
const CHANNELS_OFFSET: usize = 22;
const SAMPLE_RATE_OFFSET: usize = 24;
const BYTE_RATE_OFFSET: usize = 28;
const BLOCK_ALIGN_OFFSET: usize = 32;
const BITS_OFFSET: usize = 34;
const DATA_SIZE_OFFSET: usize = 40;

/// Parsed copy of a container header.
///
/// Keeps the original 44 header bytes so re-wrapping can copy every field
/// other than the size fields byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHeader {
    raw: [u8; HEADER_LEN],
}

impl ContainerHeader {
    /// Build a header from scratch for the given PCM layout.
    pub fn from_format(format: PcmFormat, data_len: usize) -> Self {
        let mut raw = [0u8; HEADER_LEN];
        raw[0..4].copy_from_slice(b"RIFF");
        raw[RIFF_SIZE_OFFSET..8].copy_from_slice(&(36 + data_len as u32).to_le_bytes());
        raw[8..12].copy_from_slice(b"WAVE");
        raw[12..16].copy_from_slice(b"fmt ");
        raw[16..20].copy_from_slice(&16u32.to_le_bytes());
        raw[20..22].copy_from_slice(&1u16.to_le_bytes()); // PCM format tag
        raw[CHANNELS_OFFSET..24].copy_from_slice(&format.channels.to_le_bytes());
        raw[SAMPLE_RATE_OFFSET..28].copy_from_slice(&format.sample_rate.to_le_bytes());
        let block_align = format.channels * (format.bits_per_sample / 8);
        let byte_rate = format.sample_rate * block_align as u32;
        raw[BYTE_RATE_OFFSET..32].copy_from_slice(&byte_rate.to_le_bytes());
        raw[BLOCK_ALIGN_OFFSET..34].copy_from_slice(&block_align.to_le_bytes());
        raw[BITS_OFFSET..36].copy_from_slice(&format.bits_per_sample.to_le_bytes());
        raw[36..40].copy_from_slice(b"data");
        raw[DATA_SIZE_OFFSET..44].copy_from_slice(&(data_len as u32).to_le_bytes());
        Self { raw }
    }

    fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::MalformedAudio(format!(
                "payload too small for container header: {} bytes",
                bytes.len()
            )));
        }
        if &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
            return Err(Error::MalformedAudio("missing RIFF/WAVE markers".into()));
        }
        if &bytes[12..16] != b"fmt " {
            return Err(Error::MalformedAudio("missing fmt chunk".into()));
        }
        if &bytes[36..40] != b"data" {
            return Err(Error::MalformedAudio("missing data chunk".into()));
        }
        let mut raw = [0u8; HEADER_LEN];
        raw.copy_from_slice(&bytes[..HEADER_LEN]);
        Ok(Self { raw })
    }

    pub fn channels(&self) -> u16 {
        u16::from_le_bytes([self.raw[CHANNELS_OFFSET], self.raw[CHANNELS_OFFSET + 1]])
    }

    pub fn sample_rate(&self) -> u32 {
        u32::from_le_bytes([
            self.raw[SAMPLE_RATE_OFFSET],
            self.raw[SAMPLE_RATE_OFFSET + 1],
            self.raw[SAMPLE_RATE_OFFSET + 2],
            self.raw[SAMPLE_RATE_OFFSET + 3],
        ])
    }

    pub fn bits_per_sample(&self) -> u16 {
        u16::from_le_bytes([self.raw[BITS_OFFSET], self.raw[BITS_OFFSET + 1]])
    }

    pub fn data_len(&self) -> usize {
        u32::from_le_bytes([
            self.raw[DATA_SIZE_OFFSET],
            self.raw[DATA_SIZE_OFFSET + 1],
            self.raw[DATA_SIZE_OFFSET + 2],
            self.raw[DATA_SIZE_OFFSET + 3],
        ]) as usize
    }

    pub fn format(&self) -> PcmFormat {
        PcmFormat {
            sample_rate: self.sample_rate(),
            channels: self.channels(),
            bits_per_sample: self.bits_per_sample(),
        }
    }

    /// Raw header bytes, size fields included.
    pub fn as_bytes(&self) -> &[u8; HEADER_LEN] {
        &self.raw
    }
}

/// Check for the container's magic markers without fully parsing it.
pub fn is_container(bytes: &[u8]) -> bool {
    bytes.len() >= HEADER_LEN && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE"
}

/// Wrap raw sample bytes in a fresh container.
pub fn wrap(raw_samples: &[u8], format: PcmFormat) -> Vec<u8> {
    let header = ContainerHeader::from_format(format, raw_samples.len());
    let mut out = Vec::with_capacity(HEADER_LEN + raw_samples.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(raw_samples);
    out
}

/// Split a container into its header and raw sample region.
///
/// The declared data length is trusted only up to the actual payload size;
/// truncated containers yield the bytes that are present.
pub fn unwrap(bytes: &[u8]) -> Result<(ContainerHeader, &[u8])> {
    let header = ContainerHeader::parse(bytes)?;
    let available = bytes.len() - HEADER_LEN;
    let data_len = header.data_len().min(available);
    Ok((header, &bytes[HEADER_LEN..HEADER_LEN + data_len]))
}

/// Rebuild a container around a different-length payload.
///
/// Every header byte except the two size fields is copied verbatim from the
/// source header: riff-size becomes `36 + data_len`, data-chunk-size
/// becomes `data_len`.
pub fn reheader(raw_samples: &[u8], header: &ContainerHeader) -> Vec<u8> {
    let mut raw = *header.as_bytes();
    raw[RIFF_SIZE_OFFSET..8].copy_from_slice(&(36 + raw_samples.len() as u32).to_le_bytes());
    raw[DATA_SIZE_OFFSET..44].copy_from_slice(&(raw_samples.len() as u32).to_le_bytes());
    let mut out = Vec::with_capacity(HEADER_LEN + raw_samples.len());
    out.extend_from_slice(&raw);
    out.extend_from_slice(raw_samples);
    out
}
