//! Chunk scheduling: slicing a complete response into delivery units
//!
//! Unit sizing is duration-banded: short responses are cut fine so the
//! first sound reaches the client quickly, long responses use larger units
//! to keep per-chunk overhead down. Whatever the band picks is clamped to
//! the configured range and then checked against the latency budget.

use bytes::Bytes;
use tracing::debug;

use crate::audio::container;
use crate::config::DeliveryConfig;
use crate::error::Result;
use crate::turn::CompleteResponse;

/// One transmission-sized slice of a complete response.
///
/// Every unit carries enough metadata for the client to reassemble the
/// response by index regardless of lane interleaving.
#[derive(Debug, Clone)]
pub struct DeliveryUnit {
    pub payload: Bytes,
    pub index: usize,
    pub total_units: usize,
    pub is_last: bool,
    pub lane: usize,
}

/// Pick the target unit duration in seconds for a response of the given
/// estimated duration.
fn unit_duration_secs(total_secs: f64, config: &DeliveryConfig) -> f64 {
    let min_secs = config.min_unit_ms as f64 / 1000.0;
    let max_secs = config.max_unit_ms as f64 / 1000.0;

    // Responses at or below the minimum unit duration go out whole.
    if total_secs <= min_secs {
        return total_secs;
    }

    let banded = if total_secs <= 2.0 {
        total_secs / 3.0
    } else if total_secs <= 5.0 {
        (total_secs / 4.0).max(1.0)
    } else if total_secs <= 10.0 {
        config.target_unit_ms as f64 / 1000.0
    } else {
        (total_secs / 5.0).min(3.0)
    };

    let clamped = banded.clamp(min_secs, max_secs);

    // A unit longer than the latency budget would stall playback start.
    let budget_secs = config.latency_budget_ms as f64 / 1000.0;
    if clamped > budget_secs {
        budget_secs.clamp(min_secs, max_secs)
    } else {
        clamped
    }
}

/// Slice a complete response into delivery units.
///
/// Only the raw sample region is sliced; each slice of a container-framed
/// response is re-wrapped with its own corrected header so it is playable
/// on its own. Slice boundaries are frame-aligned, and concatenating all
/// units' sample regions in index order reproduces the source exactly.
pub fn plan(response: &CompleteResponse, config: &DeliveryConfig) -> Result<Vec<DeliveryUnit>> {
    let raw = response.raw_samples();
    if raw.is_empty() {
        return Ok(Vec::new());
    }

    let total_secs = response.duration_secs();
    let unit_secs = unit_duration_secs(total_secs, config);

    let frame_size = response.format.frame_size().max(1);
    let bytes_per_second = response.format.bytes_per_second().max(frame_size);
    // Whole-response units take the exact byte length; converting through
    // seconds can truncate a byte and split off a tiny trailing unit.
    let unit_bytes = if total_secs <= config.min_unit_ms as f64 / 1000.0 {
        raw.len()
    } else {
        let mut unit_bytes = (unit_secs * bytes_per_second as f64) as usize;
        unit_bytes -= unit_bytes % frame_size;
        unit_bytes.max(frame_size)
    };

    let total_units = raw.len().div_ceil(unit_bytes);
    let mut units = Vec::with_capacity(total_units);
    for (index, slice) in raw.chunks(unit_bytes).enumerate() {
        let payload = match &response.header {
            Some(header) => Bytes::from(container::reheader(slice, header)),
            None => Bytes::copy_from_slice(slice),
        };
        units.push(DeliveryUnit {
            payload,
            index,
            total_units,
            is_last: index + 1 == total_units,
            lane: index % config.lane_count.max(1),
        });
    }

    debug!(
        turn_id = %response.turn_id,
        total_secs,
        unit_secs,
        total_units,
        "Planned response delivery"
    );
    Ok(units)
}
