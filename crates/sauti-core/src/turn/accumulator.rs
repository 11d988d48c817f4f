//! Response accumulation and turn-order queueing
//!
//! The upstream engine gives no explicit end-of-turn signal, so an idle
//! window after the last fragment is the completion heuristic. The timer
//! itself lives in the relay orchestrator; this type owns the buffered
//! state so its transitions can be tested synchronously.

use bytes::Bytes;
use std::collections::VecDeque;
use tracing::debug;

use crate::config::PcmFormat;
use crate::error::Result;
use crate::turn::response::{AudioFragment, CompleteResponse, PendingResponse};

/// Buffered fragments for the active turn plus completed responses waiting
/// for an earlier response to finish delivery.
#[derive(Debug, Default)]
pub struct Accumulator {
    active: Option<PendingResponse>,
    queue: VecDeque<CompleteResponse>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment to the active pending response, creating one when
    /// this is the first fragment of a turn. Returns the number of
    /// fragments buffered for the turn.
    pub fn push_fragment(&mut self, turn_id: &str, bytes: Bytes) -> usize {
        let fragment = AudioFragment::new(bytes);
        match &mut self.active {
            Some(pending) => {
                pending.push(fragment);
                pending.fragment_count()
            }
            None => {
                self.active = Some(PendingResponse::new(turn_id, fragment));
                1
            }
        }
    }

    /// True once the active turn has outlived the force-completion ceiling.
    pub fn past_ceiling(&self, ceiling_ms: u64) -> bool {
        self.active
            .as_ref()
            .map(|p| p.first_fragment_at.elapsed().as_millis() as u64 >= ceiling_ms)
            .unwrap_or(false)
    }

    pub fn has_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_turn_id(&self) -> Option<&str> {
        self.active.as_ref().map(|p| p.turn_id.as_str())
    }

    /// Merge the active pending response into a complete one, leaving the
    /// accumulator ready for the next turn. `None` when no turn is active
    /// (a timer that fired after interruption, for instance).
    pub fn complete_active(&mut self, fallback: PcmFormat) -> Option<Result<CompleteResponse>> {
        let pending = self.active.take()?;
        debug!(
            turn_id = %pending.turn_id,
            fragments = pending.fragment_count(),
            bytes = pending.byte_len(),
            "Merging pending response"
        );
        Some(pending.merge(fallback))
    }

    /// Hold a completed response until the one ahead of it finishes.
    pub fn enqueue(&mut self, response: CompleteResponse) {
        self.queue.push_back(response);
    }

    /// Next completed response in turn order.
    pub fn pop_queued(&mut self) -> Option<CompleteResponse> {
        self.queue.pop_front()
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    /// Drop the active pending response and every queued response.
    pub fn clear(&mut self) {
        let dropped_active = self.active.take().is_some();
        let dropped_queued = self.queue.len();
        self.queue.clear();
        if dropped_active || dropped_queued > 0 {
            debug!(
                dropped_active,
                dropped_queued, "Cleared accumulator on interruption"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::wrap;

    #[test]
    fn fragments_append_in_arrival_order() {
        let mut acc = Accumulator::new();
        assert_eq!(acc.push_fragment("t1", Bytes::from_static(&[1, 2])), 1);
        assert_eq!(acc.push_fragment("t1", Bytes::from_static(&[3, 4])), 2);
        assert_eq!(acc.active_turn_id(), Some("t1"));

        let complete = acc.complete_active(PcmFormat::default()).unwrap().unwrap();
        assert_eq!(complete.raw_samples(), &[1, 2, 3, 4]);
        assert!(!acc.has_active());
    }

    #[test]
    fn complete_without_active_turn_is_a_noop() {
        let mut acc = Accumulator::new();
        assert!(acc.complete_active(PcmFormat::default()).is_none());
    }

    #[test]
    fn queue_preserves_turn_order() {
        let mut acc = Accumulator::new();
        for turn in ["t1", "t2"] {
            acc.push_fragment(turn, Bytes::from(wrap(&[0u8; 8], PcmFormat::default())));
            let complete = acc.complete_active(PcmFormat::default()).unwrap().unwrap();
            acc.enqueue(complete);
        }
        assert_eq!(acc.queued_len(), 2);
        assert_eq!(acc.pop_queued().unwrap().turn_id, "t1");
        assert_eq!(acc.pop_queued().unwrap().turn_id, "t2");
    }

    #[test]
    fn clear_drops_active_and_queued() {
        let mut acc = Accumulator::new();
        acc.push_fragment("t1", Bytes::from_static(&[0u8; 4]));
        let complete = acc.complete_active(PcmFormat::default()).unwrap().unwrap();
        acc.enqueue(complete);
        acc.push_fragment("t2", Bytes::from_static(&[0u8; 4]));

        acc.clear();
        assert!(!acc.has_active());
        assert_eq!(acc.queued_len(), 0);
    }
}
