//! End-to-end relay flow tests with a mock transport and upstream engine.
//!
//! All tests run on a paused tokio clock so idle timeouts and lane pacing
//! elapse instantly and deterministically.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

use sauti_core::audio::{self, container};
use sauti_core::{
    DeliveryConfig, DeliveryUnit, Error, EventSink, PcmFormat, Relay, Result, TurnPhase,
    UpstreamEngine,
};

#[derive(Debug, Clone)]
enum Event {
    Chunk {
        index: usize,
        total: usize,
        is_last: bool,
        raw_len: usize,
    },
    Complete {
        total: usize,
    },
    Text(String),
    Interrupted {
        ack: bool,
    },
}

#[derive(Default)]
struct MockSink {
    events: Mutex<Vec<Event>>,
}

impl MockSink {
    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn chunk_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::Chunk { .. }))
            .count()
    }

    fn completes(&self) -> Vec<usize> {
        self.events()
            .iter()
            .filter_map(|e| match e {
                Event::Complete { total } => Some(*total),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl EventSink for MockSink {
    async fn audio_chunk(&self, _cid: &str, unit: &DeliveryUnit) -> Result<()> {
        let raw_len = if container::is_container(&unit.payload) {
            audio::unwrap(&unit.payload)?.1.len()
        } else {
            unit.payload.len()
        };
        self.events.lock().unwrap().push(Event::Chunk {
            index: unit.index,
            total: unit.total_units,
            is_last: unit.is_last,
            raw_len,
        });
        Ok(())
    }

    async fn audio_complete(&self, _cid: &str, total_units: usize) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(Event::Complete { total: total_units });
        Ok(())
    }

    async fn text_ready(&self, _cid: &str, text: &str) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(Event::Text(text.to_string()));
        Ok(())
    }

    async fn interruption_confirmed(&self, _cid: &str, ack: bool) -> Result<()> {
        self.events.lock().unwrap().push(Event::Interrupted { ack });
        Ok(())
    }
}

#[derive(Default)]
struct MockUpstream {
    interrupts: Mutex<Vec<String>>,
    fail_interrupt: AtomicBool,
}

#[async_trait]
impl UpstreamEngine for MockUpstream {
    async fn send_text(&self, _cid: &str, _text: &str) -> Result<()> {
        Ok(())
    }

    async fn send_audio(&self, _cid: &str, _audio: Bytes) -> Result<()> {
        Ok(())
    }

    async fn interrupt(&self, cid: &str) -> Result<()> {
        if self.fail_interrupt.load(Ordering::Relaxed) {
            return Err(Error::UpstreamDisconnected("engine gone".into()));
        }
        self.interrupts.lock().unwrap().push(cid.to_string());
        Ok(())
    }
}

fn format_48k() -> PcmFormat {
    PcmFormat {
        sample_rate: 48000,
        channels: 1,
        bits_per_sample: 16,
    }
}

fn setup(config: DeliveryConfig) -> (Arc<Relay>, Arc<MockSink>, Arc<MockUpstream>) {
    let sink = Arc::new(MockSink::default());
    let upstream = Arc::new(MockUpstream::default());
    let relay = Arc::new(
        Relay::new(config, sink.clone(), upstream.clone()).expect("valid config"),
    );
    (relay, sink, upstream)
}

/// A container-framed response of roughly `secs` seconds at 8kHz mono.
fn long_fragment(secs: f64) -> Bytes {
    let format = PcmFormat {
        sample_rate: 8000,
        channels: 1,
        bits_per_sample: 16,
    };
    let bytes = (secs * format.bytes_per_second() as f64) as usize;
    let raw: Vec<u8> = (0..bytes).map(|i| (i % 97) as u8).collect();
    Bytes::from(audio::wrap(&raw, format))
}

/// Config tuned for many small units so tests can observe mid-delivery.
fn fine_grained_config() -> DeliveryConfig {
    DeliveryConfig {
        min_unit_ms: 100,
        max_unit_ms: 500,
        target_unit_ms: 400,
        latency_budget_ms: 500,
        inter_unit_delay_ms: 50,
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn reference_scenario_single_unit_response() {
    let (relay, sink, _) = setup(DeliveryConfig::default());

    // Three 4000-byte 48kHz fragments, 100ms apart, then silence.
    for _ in 0..3 {
        let raw = vec![0x55u8; 4000];
        relay.on_fragment("c1", Some("t1"), Bytes::from(audio::wrap(&raw, format_48k())));
        sleep(Duration::from_millis(100)).await;
    }

    // Still inside the idle window: nothing delivered yet.
    sleep(Duration::from_millis(400)).await;
    assert_eq!(sink.chunk_count(), 0);

    // Idle timeout elapses.
    sleep(Duration::from_secs(2)).await;

    let events = sink.events();
    let chunks: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            Event::Chunk {
                total,
                is_last,
                raw_len,
                ..
            } => Some((*total, *is_last, *raw_len)),
            _ => None,
        })
        .collect();
    // 12000 raw bytes at 0.125s: one unit covering the whole response.
    assert_eq!(chunks, vec![(1, true, 12000)]);
    assert_eq!(sink.completes(), vec![1]);
}

#[tokio::test(start_paused = true)]
async fn idle_timeout_merges_all_fragments_into_one_response() {
    let (relay, sink, _) = setup(DeliveryConfig::default());

    for i in 0..5u8 {
        let raw = vec![i; 1000];
        relay.on_fragment("c1", Some("t1"), Bytes::from(audio::wrap(&raw, format_48k())));
        sleep(Duration::from_millis(200)).await;
    }
    sleep(Duration::from_secs(3)).await;

    // Exactly one response, all five fragments merged.
    assert_eq!(sink.completes().len(), 1);
    let total_raw: usize = sink
        .events()
        .iter()
        .filter_map(|e| match e {
            Event::Chunk { raw_len, .. } => Some(*raw_len),
            _ => None,
        })
        .sum();
    assert_eq!(total_raw, 5000);
}

#[tokio::test(start_paused = true)]
async fn force_completion_ceiling_bounds_continuous_input() {
    let (relay, sink, _) = setup(DeliveryConfig::default());

    // Fragments every 300ms never trip the 800ms idle window; the 2s
    // ceiling cuts the stream into a first response mid-arrival, and the
    // remaining fragments finish as a second one. A pure idle-timeout
    // completion would have merged everything into a single response.
    for _ in 0..12 {
        relay.on_fragment("c1", Some("t1"), Bytes::from(audio::wrap(&[1u8; 600], format_48k())));
        sleep(Duration::from_millis(300)).await;
    }
    sleep(Duration::from_secs(3)).await;

    assert_eq!(sink.completes().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn fragment_during_delivery_does_not_stall_it() {
    let (relay, sink, _) = setup(fine_grained_config());

    relay.on_fragment("c1", Some("t1"), long_fragment(8.0));
    sleep(Duration::from_millis(900)).await; // delivery underway
    let before = sink.chunk_count();
    assert!(before > 0);

    // A fresh turn's fragment re-arms the idle timer while the first
    // response is still going out; delivery must keep flowing.
    relay.on_fragment("c1", Some("t2"), long_fragment(0.3));
    sleep(Duration::from_secs(20)).await;

    assert!(sink.chunk_count() > before);
    assert_eq!(sink.completes().len(), 2);
    assert_eq!(relay.snapshot("c1").unwrap().phase, TurnPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn responses_deliver_in_turn_order() {
    let (relay, sink, _) = setup(fine_grained_config());

    // Turn 1: long response that takes a while to deliver.
    relay.on_fragment("c1", Some("t1"), long_fragment(20.0));
    sleep(Duration::from_millis(900)).await; // idle timeout fires, delivery starts

    // Turn 2 completes while turn 1 is still going out.
    relay.on_fragment("c1", Some("t2"), long_fragment(1.0));
    sleep(Duration::from_secs(30)).await;

    let events = sink.events();
    let completes: Vec<usize> = events
        .iter()
        .enumerate()
        .filter_map(|(i, e)| matches!(e, Event::Complete { .. }).then_some(i))
        .collect();
    assert_eq!(completes.len(), 2, "both responses should finish");

    // No chunk of response 2 may appear before response 1's completion
    // marker. Response totals differ, so chunks are attributable.
    let first_total = match events.iter().find(|e| matches!(e, Event::Chunk { .. })) {
        Some(Event::Chunk { total, .. }) => *total,
        _ => panic!("no chunks recorded"),
    };
    for (i, event) in events.iter().enumerate() {
        if let Event::Chunk { total, .. } = event {
            if *total != first_total {
                assert!(i > completes[0], "second response started early");
            }
        }
    }
}

#[tokio::test(start_paused = true)]
async fn interruption_halts_delivery_immediately() {
    let (relay, sink, upstream) = setup(fine_grained_config());

    relay.on_fragment("c1", Some("t1"), long_fragment(8.0));
    sleep(Duration::from_millis(900)).await; // delivery underway
    assert!(sink.chunk_count() > 0);

    relay.interrupt("c1").await.unwrap();
    let at_interrupt = sink.chunk_count();

    // Late fragments from a delayed upstream keep arriving; time passes.
    for _ in 0..4 {
        relay.on_fragment("c1", Some("t1"), Bytes::from(audio::wrap(&[9u8; 400], format_48k())));
        sleep(Duration::from_millis(30)).await;
    }
    sleep(Duration::from_secs(10)).await;

    // No further chunk for the interrupted generation, and no completion
    // marker for it either.
    let after = sink.events();
    let chunks_after: usize = after
        .iter()
        .filter(|e| matches!(e, Event::Chunk { .. }))
        .count();
    assert_eq!(chunks_after, at_interrupt);
    assert!(sink.completes().is_empty());
    assert!(after.iter().any(|e| matches!(e, Event::Interrupted { ack: true })));
    assert_eq!(upstream.interrupts.lock().unwrap().as_slice(), ["c1"]);
}

#[tokio::test(start_paused = true)]
async fn interruption_clears_queued_responses() {
    let (relay, sink, _) = setup(fine_grained_config());

    relay.on_fragment("c1", Some("t1"), long_fragment(20.0));
    sleep(Duration::from_millis(900)).await;

    // Queue a second response behind the in-flight one, then interrupt.
    relay.on_fragment("c1", Some("t2"), long_fragment(1.0));
    sleep(Duration::from_millis(900)).await;
    relay.interrupt("c1").await.unwrap();

    sleep(Duration::from_secs(30)).await;

    // Neither response finishes: the first was cut off, the second discarded.
    assert!(sink.completes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn conversation_recovers_after_interruption() {
    let (relay, sink, _) = setup(DeliveryConfig::default());

    relay.on_fragment("c1", Some("t1"), long_fragment(4.0));
    sleep(Duration::from_millis(100)).await;
    relay.interrupt("c1").await.unwrap();

    // Within the resume window fragments are dropped.
    relay.on_fragment("c1", Some("t1"), long_fragment(1.0));
    assert_eq!(relay.snapshot("c1").unwrap().phase, TurnPhase::Interrupted);

    // After the momentary interrupted flag clears, a fresh turn flows.
    sleep(Duration::from_millis(400)).await;
    assert_eq!(relay.snapshot("c1").unwrap().phase, TurnPhase::Idle);

    relay.on_fragment("c1", Some("t2"), long_fragment(0.2));
    sleep(Duration::from_secs(3)).await;
    assert_eq!(sink.completes().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn interruption_ack_reports_upstream_failure() {
    let (relay, sink, upstream) = setup(DeliveryConfig::default());
    upstream.fail_interrupt.store(true, Ordering::Relaxed);

    relay.on_fragment("c1", Some("t1"), long_fragment(1.0));
    relay.interrupt("c1").await.unwrap();

    // Local interruption always succeeds; partial success is reported.
    assert!(sink
        .events()
        .iter()
        .any(|e| matches!(e, Event::Interrupted { ack: false })));
}

#[tokio::test(start_paused = true)]
async fn upstream_disconnect_surfaces_fallback_response() {
    let (relay, sink, _) = setup(DeliveryConfig::default());

    relay.on_fragment("c1", Some("t1"), long_fragment(2.0));
    sleep(Duration::from_millis(100)).await;
    relay.on_upstream_disconnected("c1").await;
    sleep(Duration::from_secs(5)).await;

    let events = sink.events();
    assert!(events.iter().any(|e| matches!(e, Event::Text(_))));
    // The placeholder tone goes out as a normal-looking audio response.
    assert!(events.iter().any(|e| matches!(e, Event::Chunk { .. })));
    assert_eq!(sink.completes().len(), 1);
    assert_eq!(relay.snapshot("c1").unwrap().queued_responses, 0);
}

#[tokio::test(start_paused = true)]
async fn fragment_after_disconnect_flows_with_new_generation() {
    let (relay, sink, _) = setup(DeliveryConfig::default());

    relay.on_fragment("c1", Some("t1"), long_fragment(1.0));
    relay.on_upstream_disconnected("c1").await;
    let fallback_completes = sink.completes().len();
    assert_eq!(fallback_completes, 1);

    // The next turn's fragment must arm its timer under the bumped
    // generation, not the one the disconnect invalidated.
    relay.on_fragment("c1", Some("t2"), long_fragment(0.2));
    sleep(Duration::from_secs(3)).await;
    assert_eq!(sink.completes().len(), fallback_completes + 1);
}

#[tokio::test(start_paused = true)]
async fn ending_a_conversation_cancels_pending_completion() {
    let (relay, sink, _) = setup(DeliveryConfig::default());

    relay.on_fragment("c1", Some("t1"), long_fragment(1.0));
    assert!(relay.end_conversation("c1"));
    sleep(Duration::from_secs(3)).await;

    assert_eq!(sink.chunk_count(), 0);
    assert_eq!(relay.conversation_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn idle_sweep_removes_stale_conversations() {
    let (relay, _, _) = setup(DeliveryConfig::default());

    relay.start_conversation("old");
    sleep(Duration::from_secs(120)).await;
    relay.start_conversation("fresh");

    let removed = relay.sweep_idle(Duration::from_secs(60));
    assert_eq!(removed, 1);
    assert!(relay.snapshot("old").is_none());
    assert!(relay.snapshot("fresh").is_some());
}
