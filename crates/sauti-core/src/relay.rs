//! Conversation orchestration and interruption control
//!
//! One [`Relay`] instance per process owns every conversation. Forward flow
//! runs fragments through the accumulator, the chunk scheduler, and the
//! delivery lanes; the interruption path cuts across all three and must win
//! every race against them.
//!
//! The only correctness guard is the per-conversation generation counter:
//! every asynchronous continuation (idle timers, delivery lane steps,
//! ceiling completions) is tagged with the generation it was created under
//! and becomes a silent no-op once an interruption has moved the counter
//! past it. All mutation of conversation state happens behind a lock that
//! is never held across an await.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::audio::tone;
use crate::config::DeliveryConfig;
use crate::delivery::{self, lanes};
use crate::error::Result;
use crate::sink::{EventSink, UpstreamEngine, UpstreamEvent};
use crate::turn::{Accumulator, CompleteResponse};

/// Spoken when the upstream engine drops mid-response; the client sees a
/// normal short response instead of an error event.
const FALLBACK_APOLOGY: &str =
    "Sorry, I ran into a problem while answering. Could you say that again?";

/// Per-conversation lifecycle phase.
///
/// `Interrupted` is momentary: it blocks input for the turn that was cut
/// off and auto-clears back to `Idle` after the configured resume delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    Accumulating,
    Delivering,
    Interrupted,
}

/// Read-only view of one conversation for status reporting.
#[derive(Debug, Clone)]
pub struct ConversationSnapshot {
    pub id: String,
    pub phase: TurnPhase,
    pub turn_count: u64,
    pub generation: u64,
    pub queued_responses: usize,
    pub age: Duration,
    pub idle_for: Duration,
}

struct ConversationInner {
    phase: TurnPhase,
    accumulator: Accumulator,
    delivering: bool,
    idle_timer: Option<JoinHandle<()>>,
    turn_count: u64,
    last_activity: Instant,
}

/// State for one logical conversation.
pub struct Conversation {
    id: String,
    generation: AtomicU64,
    started_at: Instant,
    inner: Mutex<ConversationInner>,
}

impl Conversation {
    fn new(id: String) -> Self {
        Self {
            id,
            generation: AtomicU64::new(1),
            started_at: Instant::now(),
            inner: Mutex::new(ConversationInner {
                phase: TurnPhase::Idle,
                accumulator: Accumulator::new(),
                delivering: false,
                idle_timer: None,
                turn_count: 0,
                last_activity: Instant::now(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConversationInner> {
        // Lock poisoning would mean a panic inside a non-awaiting critical
        // section; recover with the inner state rather than cascading.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

/// The relay core: conversation registry plus the forward-flow and
/// interruption entry points. Constructed once at startup and shared.
pub struct Relay {
    config: DeliveryConfig,
    sink: Arc<dyn EventSink>,
    upstream: Arc<dyn UpstreamEngine>,
    conversations: Mutex<HashMap<String, Arc<Conversation>>>,
}

impl Relay {
    pub fn new(
        config: DeliveryConfig,
        sink: Arc<dyn EventSink>,
        upstream: Arc<dyn UpstreamEngine>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            sink,
            upstream,
            conversations: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Register a conversation, or return the existing one.
    pub fn start_conversation(&self, id: &str) -> Arc<Conversation> {
        let mut map = self.conversations.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(id.to_string())
            .or_insert_with(|| {
                info!(conversation_id = id, "Conversation started");
                Arc::new(Conversation::new(id.to_string()))
            })
            .clone()
    }

    fn conversation(&self, id: &str) -> Option<Arc<Conversation>> {
        let map = self.conversations.lock().unwrap_or_else(|e| e.into_inner());
        map.get(id).cloned()
    }

    /// Drop a conversation and invalidate all of its pending continuations.
    pub fn end_conversation(&self, id: &str) -> bool {
        let removed = {
            let mut map = self.conversations.lock().unwrap_or_else(|e| e.into_inner());
            map.remove(id)
        };
        match removed {
            Some(conv) => {
                conv.generation.fetch_add(1, Ordering::AcqRel);
                let mut inner = conv.lock();
                if let Some(timer) = inner.idle_timer.take() {
                    timer.abort();
                }
                inner.accumulator.clear();
                info!(conversation_id = id, "Conversation ended");
                true
            }
            None => false,
        }
    }

    /// Remove conversations that have been inactive past `max_idle`.
    pub fn sweep_idle(&self, max_idle: Duration) -> usize {
        let stale_ids: Vec<String> = {
            let map = self.conversations.lock().unwrap_or_else(|e| e.into_inner());
            map.values()
                .filter(|conv| conv.lock().last_activity.elapsed() > max_idle)
                .map(|conv| conv.id.clone())
                .collect()
        };
        let count = stale_ids.len();
        for id in stale_ids {
            self.end_conversation(&id);
        }
        count
    }

    pub fn conversation_count(&self) -> usize {
        self.conversations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn snapshot(&self, id: &str) -> Option<ConversationSnapshot> {
        let conv = self.conversation(id)?;
        let inner = conv.lock();
        Some(ConversationSnapshot {
            id: conv.id.clone(),
            phase: inner.phase,
            turn_count: inner.turn_count,
            generation: conv.generation(),
            queued_responses: inner.accumulator.queued_len(),
            age: conv.started_at.elapsed(),
            idle_for: inner.last_activity.elapsed(),
        })
    }

    /// Forward user text input to the upstream engine.
    pub async fn send_text_input(self: &Arc<Self>, conversation_id: &str, text: &str) -> Result<()> {
        self.touch(conversation_id);
        if let Err(e) = self.upstream.send_text(conversation_id, text).await {
            warn!(conversation_id, "Upstream rejected text input: {}", e);
            self.surface_fallback(conversation_id).await;
            return Err(e);
        }
        Ok(())
    }

    /// Forward user audio input to the upstream engine.
    pub async fn send_audio_input(
        self: &Arc<Self>,
        conversation_id: &str,
        audio: Bytes,
    ) -> Result<()> {
        self.touch(conversation_id);
        if let Err(e) = self.upstream.send_audio(conversation_id, audio).await {
            warn!(conversation_id, "Upstream rejected audio input: {}", e);
            self.surface_fallback(conversation_id).await;
            return Err(e);
        }
        Ok(())
    }

    /// Signal the upstream engine that the user's turn is over.
    pub async fn finish_user_turn(&self, conversation_id: &str) -> Result<()> {
        self.touch(conversation_id);
        self.upstream.end_of_input(conversation_id).await
    }

    fn touch(&self, conversation_id: &str) {
        let conv = self.start_conversation(conversation_id);
        conv.lock().last_activity = Instant::now();
    }

    /// Entry point for upstream streaming-callback events.
    pub async fn on_upstream_event(self: &Arc<Self>, event: UpstreamEvent) -> Result<()> {
        if event.interrupted {
            return self.interrupt(&event.conversation_id).await;
        }
        if let Some(text) = &event.text {
            self.touch(&event.conversation_id);
            self.sink.text_ready(&event.conversation_id, text).await?;
        }
        if let Some(audio) = event.audio {
            self.on_fragment(&event.conversation_id, event.turn_id.as_deref(), audio);
        }
        Ok(())
    }

    /// Accept one audio fragment for a turn.
    ///
    /// Re-arms the idle-completion timer, except when the turn has already
    /// outlived the force-completion ceiling, in which case the response is
    /// completed right away.
    pub fn on_fragment(self: &Arc<Self>, conversation_id: &str, turn_id: Option<&str>, bytes: Bytes) {
        let conv = self.start_conversation(conversation_id);
        let mut inner = conv.lock();
        // Read the generation under the lock so a concurrent interruption
        // or disconnect cannot slip between the read and the timer arm.
        let generation = conv.generation();
        if inner.phase == TurnPhase::Interrupted {
            debug!(conversation_id, "Fragment dropped during interruption window");
            return;
        }

        if !inner.accumulator.has_active() {
            inner.turn_count += 1;
            if inner.phase == TurnPhase::Idle {
                inner.phase = TurnPhase::Accumulating;
            }
        }
        let turn_id = turn_id
            .map(str::to_owned)
            .or_else(|| inner.accumulator.active_turn_id().map(str::to_owned))
            .unwrap_or_else(|| format!("turn-{}", inner.turn_count));
        inner.accumulator.push_fragment(&turn_id, bytes);
        inner.last_activity = Instant::now();

        if let Some(timer) = inner.idle_timer.take() {
            timer.abort();
        }

        if inner
            .accumulator
            .past_ceiling(self.config.force_completion_ceiling_ms)
        {
            debug!(conversation_id, "Force-completion ceiling reached");
            drop(inner);
            let relay = Arc::clone(self);
            let id = conversation_id.to_string();
            tokio::spawn(async move {
                relay.complete_turn(id, generation).await;
            });
            return;
        }

        // One cancellable timer per conversation, re-armed on every
        // fragment; the generation tag makes a late firing harmless.
        // Completion runs on its own task so aborting the timer handle
        // cannot kill a delivery already in flight.
        let relay = Arc::clone(self);
        let id = conversation_id.to_string();
        let idle = Duration::from_millis(self.config.idle_timeout_ms);
        inner.idle_timer = Some(tokio::spawn(async move {
            sleep(idle).await;
            tokio::spawn(async move {
                relay.complete_turn(id, generation).await;
            });
        }));
    }

    /// Merge the active turn and deliver it, then drain queued responses in
    /// turn order. Stale generations are silent no-ops.
    async fn complete_turn(self: Arc<Self>, conversation_id: String, expected_generation: u64) {
        let Some(conv) = self.conversation(&conversation_id) else {
            return;
        };
        if conv.generation() != expected_generation {
            debug!(
                conversation_id,
                "Completion for stale generation ignored"
            );
            return;
        }

        let first = {
            let mut inner = conv.lock();
            let merged = match inner.accumulator.complete_active(self.config.fallback_format) {
                None => return,
                Some(Ok(response)) => response,
                Some(Err(e)) => {
                    warn!(conversation_id, "Merge failed, substituting placeholder: {}", e);
                    match self.placeholder_response() {
                        Some(response) => response,
                        None => return,
                    }
                }
            };

            if inner.delivering {
                // An earlier response is still going out; preserve turn order.
                inner.accumulator.enqueue(merged);
                return;
            }
            inner.delivering = true;
            inner.phase = TurnPhase::Delivering;
            merged
        };

        self.deliver_in_order(&conv, first, expected_generation).await;
    }

    /// Deliver `response`, then any responses queued behind it.
    async fn deliver_in_order(
        &self,
        conv: &Arc<Conversation>,
        response: CompleteResponse,
        expected_generation: u64,
    ) {
        let mut current = response;
        loop {
            let units = match delivery::plan(&current, &self.config) {
                Ok(units) => units,
                Err(e) => {
                    warn!(conversation_id = %conv.id, "Chunk planning failed: {}", e);
                    Vec::new()
                }
            };

            debug!(
                conversation_id = %conv.id,
                turn_id = %current.turn_id,
                units = units.len(),
                "Delivering response"
            );
            let outcome = lanes::deliver(
                self.sink.as_ref(),
                &conv.id,
                &units,
                &self.config,
                &conv.generation,
                expected_generation,
            )
            .await;

            if outcome.interrupted {
                // The interruption path already cleared state; leave it be.
                debug!(conversation_id = %conv.id, "Delivery cut short by interruption");
                return;
            }

            let mut inner = conv.lock();
            match inner.accumulator.pop_queued() {
                Some(next) => current = next,
                None => {
                    inner.delivering = false;
                    if inner.phase == TurnPhase::Delivering {
                        inner.phase = if inner.accumulator.has_active() {
                            TurnPhase::Accumulating
                        } else {
                            TurnPhase::Idle
                        };
                    }
                    return;
                }
            }
        }
    }

    /// Halt everything for this conversation's current turn.
    ///
    /// Local effects (generation bump, cleared buffers, stopped lanes)
    /// always succeed; the upstream notification is best-effort and its
    /// outcome is reported in the acknowledgement event.
    pub async fn interrupt(self: &Arc<Self>, conversation_id: &str) -> Result<()> {
        let conv = self.start_conversation(conversation_id);
        let new_generation = conv.generation.fetch_add(1, Ordering::AcqRel) + 1;

        {
            let mut inner = conv.lock();
            if let Some(timer) = inner.idle_timer.take() {
                timer.abort();
            }
            inner.accumulator.clear();
            inner.delivering = false;
            inner.phase = TurnPhase::Interrupted;
            inner.last_activity = Instant::now();
        }
        info!(conversation_id, generation = new_generation, "Interrupted");

        // The interrupted flag is momentary; clear it so the next user turn
        // is not blocked.
        let relay = Arc::clone(self);
        let id = conversation_id.to_string();
        let resume_delay = Duration::from_millis(self.config.resume_delay_ms);
        tokio::spawn(async move {
            sleep(resume_delay).await;
            if let Some(conv) = relay.conversation(&id) {
                let mut inner = conv.lock();
                if conv.generation() == new_generation && inner.phase == TurnPhase::Interrupted {
                    inner.phase = TurnPhase::Idle;
                }
            }
        });

        let upstream_acknowledged = match self.upstream.interrupt(conversation_id).await {
            Ok(()) => true,
            Err(e) => {
                warn!(conversation_id, "Upstream did not acknowledge interrupt: {}", e);
                false
            }
        };

        if let Err(e) = self
            .sink
            .interruption_confirmed(conversation_id, upstream_acknowledged)
            .await
        {
            warn!(conversation_id, "Failed to emit interruption acknowledgement: {}", e);
        }
        Ok(())
    }

    /// React to the upstream engine dropping mid-response: discard in-flight
    /// state, return to idle, and surface a short fallback response.
    pub async fn on_upstream_disconnected(self: &Arc<Self>, conversation_id: &str) {
        let Some(conv) = self.conversation(conversation_id) else {
            return;
        };
        conv.generation.fetch_add(1, Ordering::AcqRel);
        {
            let mut inner = conv.lock();
            if let Some(timer) = inner.idle_timer.take() {
                timer.abort();
            }
            inner.accumulator.clear();
            inner.delivering = false;
            inner.phase = TurnPhase::Idle;
        }
        warn!(conversation_id, "Upstream disconnected, state discarded");
        self.surface_fallback(conversation_id).await;
    }

    /// Send the apology text plus a short placeholder tone as a
    /// normal-looking response.
    async fn surface_fallback(self: &Arc<Self>, conversation_id: &str) {
        if let Err(e) = self.sink.text_ready(conversation_id, FALLBACK_APOLOGY).await {
            warn!(conversation_id, "Failed to send fallback text: {}", e);
        }

        let Some(response) = self.placeholder_response() else {
            return;
        };
        let Some(conv) = self.conversation(conversation_id) else {
            return;
        };
        let generation = conv.generation();
        {
            let mut inner = conv.lock();
            if inner.delivering {
                inner.accumulator.enqueue(response);
                return;
            }
            inner.delivering = true;
            inner.phase = TurnPhase::Delivering;
        }
        self.deliver_in_order(&conv, response, generation).await;
    }

    fn placeholder_response(&self) -> Option<CompleteResponse> {
        let tone = tone::placeholder_tone(self.config.fallback_format, 400, 440.0).ok()?;
        CompleteResponse::from_container("fallback", tone).ok()
    }
}
