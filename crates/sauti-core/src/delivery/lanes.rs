//! Parallel delivery lanes
//!
//! Units are partitioned across lanes round-robin by index. Lanes run
//! concurrently on the same task via `join_all`, each pacing its units
//! with a small delay and starting staggered so transmissions pipeline
//! instead of bursting in lockstep. A lane checks the conversation's
//! generation before dispatching each unit; an interruption lets the
//! in-flight write finish but stops everything after it.

use futures::future::join_all;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::DeliveryConfig;
use crate::delivery::scheduler::DeliveryUnit;
use crate::sink::EventSink;

/// What happened to a response's delivery.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryOutcome {
    /// Units actually transmitted.
    pub delivered: usize,
    /// True when an interruption cut delivery short.
    pub interrupted: bool,
}

/// Transmit all units for one response, then emit the completion marker.
///
/// Unit 0 is sent immediately ahead of the lane scheme to minimize
/// time-to-first-sound. On any transmission error the remaining units are
/// drained through a single-lane sequential path with a larger delay,
/// preserving index order and delivering each unit at most once.
pub async fn deliver(
    sink: &dyn EventSink,
    conversation_id: &str,
    units: &[DeliveryUnit],
    config: &DeliveryConfig,
    generation: &AtomicU64,
    expected_generation: u64,
) -> DeliveryOutcome {
    let total_units = units.len();
    let stale = || generation.load(Ordering::Acquire) != expected_generation;

    if total_units == 0 {
        if !stale() {
            let _ = sink.audio_complete(conversation_id, 0).await;
        }
        return DeliveryOutcome {
            delivered: 0,
            interrupted: stale(),
        };
    }

    if stale() {
        return DeliveryOutcome {
            delivered: 0,
            interrupted: true,
        };
    }

    let delivered: Vec<AtomicBool> = (0..total_units).map(|_| AtomicBool::new(false)).collect();
    let mut transport_failed = false;

    // Priority unit: straight out, no pacing.
    match sink.audio_chunk(conversation_id, &units[0]).await {
        Ok(()) => delivered[0].store(true, Ordering::Release),
        Err(e) => {
            warn!(conversation_id, "Priority unit failed, switching to sequential fallback: {}", e);
            transport_failed = true;
        }
    }

    if !transport_failed && total_units > 1 {
        let lane_count = config.lane_count.max(1);
        let lane_futures = (0..lane_count).map(|lane| {
            let delivered = &delivered;
            let units = &units[1..];
            let stale = &stale;
            async move {
                if lane > 0 {
                    sleep(Duration::from_millis(config.inter_lane_delay_ms * lane as u64)).await;
                }
                let bucket = units.iter().filter(|u| u.lane == lane);
                for unit in bucket {
                    if stale() {
                        debug!(conversation_id, lane, "Lane observed stale generation, stopping");
                        return Ok(());
                    }
                    sink.audio_chunk(conversation_id, unit).await?;
                    delivered[unit.index].store(true, Ordering::Release);
                    sleep(Duration::from_millis(config.inter_unit_delay_ms)).await;
                }
                Ok::<(), crate::error::Error>(())
            }
        });

        for result in join_all(lane_futures).await {
            if let Err(e) = result {
                warn!(conversation_id, "Lane transmission failed: {}", e);
                transport_failed = true;
            }
        }
    }

    if transport_failed {
        sequential_fallback(sink, conversation_id, units, config, &delivered, &stale).await;
    }

    let count = delivered
        .iter()
        .filter(|d| d.load(Ordering::Acquire))
        .count();
    let interrupted = stale();
    if !interrupted {
        if let Err(e) = sink.audio_complete(conversation_id, total_units).await {
            warn!(conversation_id, "Failed to emit completion marker: {}", e);
        }
    }

    DeliveryOutcome {
        delivered: count,
        interrupted,
    }
}

/// Strictly sequential single-lane path for the remainder of a response
/// whose parallel delivery hit a transport error.
async fn sequential_fallback(
    sink: &dyn EventSink,
    conversation_id: &str,
    units: &[DeliveryUnit],
    config: &DeliveryConfig,
    delivered: &[AtomicBool],
    stale: &(dyn Fn() -> bool + Sync),
) {
    debug!(conversation_id, "Draining remaining units sequentially");
    for unit in units {
        if delivered[unit.index].load(Ordering::Acquire) {
            continue;
        }
        if stale() {
            return;
        }
        match sink.audio_chunk(conversation_id, unit).await {
            Ok(()) => delivered[unit.index].store(true, Ordering::Release),
            Err(e) => {
                warn!(
                    conversation_id,
                    index = unit.index,
                    "Fallback transmission failed, unit dropped: {}",
                    e
                );
            }
        }
        sleep(Duration::from_millis(config.fallback_unit_delay_ms)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::HashSet;
    use std::sync::Mutex;

    use crate::error::{Error, Result};

    #[derive(Default)]
    struct RecordingSink {
        chunks: Mutex<Vec<usize>>,
        completes: Mutex<Vec<usize>>,
        fail_indices: Mutex<HashSet<usize>>,
    }

    impl RecordingSink {
        fn fail_once_on(&self, index: usize) {
            self.fail_indices.lock().unwrap().insert(index);
        }
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn audio_chunk(&self, _cid: &str, unit: &DeliveryUnit) -> Result<()> {
            if self.fail_indices.lock().unwrap().remove(&unit.index) {
                return Err(Error::DeliveryTransport("injected failure".into()));
            }
            self.chunks.lock().unwrap().push(unit.index);
            Ok(())
        }

        async fn audio_complete(&self, _cid: &str, total_units: usize) -> Result<()> {
            self.completes.lock().unwrap().push(total_units);
            Ok(())
        }

        async fn text_ready(&self, _cid: &str, _text: &str) -> Result<()> {
            Ok(())
        }

        async fn interruption_confirmed(&self, _cid: &str, _ack: bool) -> Result<()> {
            Ok(())
        }
    }

    fn make_units(count: usize, lane_count: usize) -> Vec<DeliveryUnit> {
        (0..count)
            .map(|index| DeliveryUnit {
                payload: Bytes::from_static(&[0u8; 8]),
                index,
                total_units: count,
                is_last: index + 1 == count,
                lane: index % lane_count,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_every_unit_once_and_signals_completion() {
        let sink = RecordingSink::default();
        let config = DeliveryConfig::default();
        let generation = AtomicU64::new(1);
        let units = make_units(7, config.lane_count);

        let outcome = deliver(&sink, "c1", &units, &config, &generation, 1).await;
        assert_eq!(outcome.delivered, 7);
        assert!(!outcome.interrupted);

        let mut seen = sink.chunks.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..7).collect::<Vec<_>>());
        assert_eq!(*sink.completes.lock().unwrap(), vec![7]);
    }

    #[tokio::test(start_paused = true)]
    async fn lane_order_is_increasing_within_each_lane() {
        let sink = RecordingSink::default();
        let config = DeliveryConfig {
            lane_count: 3,
            ..Default::default()
        };
        let generation = AtomicU64::new(1);
        let units = make_units(10, config.lane_count);

        deliver(&sink, "c1", &units, &config, &generation, 1).await;

        let order = sink.chunks.lock().unwrap().clone();
        for lane in 0..3 {
            let lane_indices: Vec<_> = order
                .iter()
                .copied()
                .filter(|i| *i > 0 && i % 3 == lane)
                .collect();
            assert!(lane_indices.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_falls_back_to_sequential_delivery() {
        let sink = RecordingSink::default();
        let config = DeliveryConfig::default();
        let generation = AtomicU64::new(1);
        let units = make_units(6, config.lane_count);
        sink.fail_once_on(3);

        let outcome = deliver(&sink, "c1", &units, &config, &generation, 1).await;
        assert_eq!(outcome.delivered, 6);

        let mut seen = sink.chunks.lock().unwrap().clone();
        seen.sort_unstable();
        // Every unit exactly once despite the injected failure.
        assert_eq!(seen, (0..6).collect::<Vec<_>>());
        assert_eq!(*sink.completes.lock().unwrap(), vec![6]);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_generation_stops_dispatch_and_suppresses_completion() {
        let sink = RecordingSink::default();
        let config = DeliveryConfig::default();
        let generation = AtomicU64::new(2);
        let units = make_units(8, config.lane_count);

        // Interrupted before delivery started.
        let outcome = deliver(&sink, "c1", &units, &config, &generation, 1).await;
        assert!(outcome.interrupted);
        assert!(sink.chunks.lock().unwrap().is_empty());
        assert!(sink.completes.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_plan_emits_zero_count_completion() {
        let sink = RecordingSink::default();
        let config = DeliveryConfig::default();
        let generation = AtomicU64::new(1);

        let outcome = deliver(&sink, "c1", &[], &config, &generation, 1).await;
        assert_eq!(outcome.delivered, 0);
        assert_eq!(*sink.completes.lock().unwrap(), vec![0]);
    }
}
