//! Placeholder tone synthesis
//!
//! When a response cannot be produced (corrupt audio from upstream, or the
//! engine dropping mid-turn) the relay sends a short soft tone instead of
//! an error event, so the conversational flow stays intact on the client.

use hound::{SampleFormat, WavSpec, WavWriter};
use std::io::Cursor;
use tracing::debug;

use crate::config::PcmFormat;
use crate::error::Result;

/// Generate a short sine tone wrapped in a standard container.
pub fn placeholder_tone(format: PcmFormat, duration_ms: u64, freq_hz: f32) -> Result<Vec<u8>> {
    let spec = WavSpec {
        channels: format.channels,
        sample_rate: format.sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let num_frames = (format.sample_rate as u64 * duration_ms / 1000) as usize;
    let mut buffer = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut buffer, spec)?;
        for i in 0..num_frames {
            let t = i as f32 / format.sample_rate as f32;
            // Linear fade-out so the tone does not click at the end.
            let envelope = 1.0 - (i as f32 / num_frames as f32);
            let sample = ((2.0 * std::f32::consts::PI * freq_hz * t).sin() * envelope * 0.2
                * i16::MAX as f32) as i16;
            for _ in 0..format.channels {
                writer.write_sample(sample)?;
            }
        }
        writer.finalize()?;
    }

    debug!(
        "Synthesized {}ms placeholder tone ({} bytes)",
        duration_ms,
        buffer.get_ref().len()
    );
    Ok(buffer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::container;

    #[test]
    fn tone_is_a_valid_container() {
        let format = PcmFormat::default();
        let tone = placeholder_tone(format, 200, 440.0).unwrap();
        assert!(container::is_container(&tone));

        let (header, raw) = container::unwrap(&tone).unwrap();
        assert_eq!(header.sample_rate(), format.sample_rate);
        // 200ms of mono 16-bit at 24kHz.
        assert_eq!(raw.len(), 24000 / 5 * 2);
    }

    #[test]
    fn tone_fades_to_silence() {
        let tone = placeholder_tone(PcmFormat::default(), 100, 440.0).unwrap();
        let (_, raw) = container::unwrap(&tone).unwrap();
        let last = i16::from_le_bytes([raw[raw.len() - 2], raw[raw.len() - 1]]);
        assert!(last.unsigned_abs() < 200);
    }
}
