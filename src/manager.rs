//! Streaming lifecycle state machine and composition root.
//!
//! One [`TranscriptManager`] owns the active session, the bounded store, the
//! notifier and the timers. All public entry points run to completion before
//! any other entry point runs; the only asynchronous boundary is the
//! fire-and-forget persistence write, whose failures are logged, never
//! propagated.
//!
//! No internal error escapes a public entry point: malformed input is
//! sanitized or dropped, listener faults are isolated, and persistence
//! faults degrade to an in-memory-only store.

use crate::clock::{Clock, SystemClock};
use crate::config::ScribeConfig;
use crate::error::ScribeError;
use crate::fragment::{TranscriptFragment, TranscriptRecord};
use crate::merge;
use crate::notify::{EventKind, Notifier, Subscription, TranscriptState};
use crate::persist::{self, BlobStore};
use crate::scheduler::{Scheduler, TimerEvent, TimerHandle};
use crate::session::StreamingSession;
use crate::store::{BoundedStore, InsertOutcome, MemoryPressure, MemoryStats};
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Completion cascades deeper than this are refused as a recoverable fault
/// instead of looping further.
const MAX_COMPLETION_DEPTH: u32 = 8;

/// Fraction of newest records kept when the persistence medium reports a
/// capacity error.
const CAPACITY_TRIM_RATIO: f64 = 0.2;

type CompletionHook = Box<dyn FnMut() + Send>;

/// Cloneable handle for requesting a new stream from inside a completion
/// hook. Queued starts are applied iteratively after the current entry point
/// finishes, never recursively.
#[derive(Clone, Default)]
pub struct StartQueue {
    inner: Arc<Mutex<VecDeque<TranscriptFragment>>>,
}

impl StartQueue {
    /// Queues a fragment to start a new session with.
    pub fn push(&self, fragment: TranscriptFragment) {
        self.lock().push_back(fragment);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn pop(&self) -> Option<TranscriptFragment> {
        self.lock().pop_front()
    }

    fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<TranscriptFragment>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owns all transcript state: the single active streaming session, the
/// bounded record history, subscriptions and timers.
///
/// Constructed and owned by the caller; there is no global instance. Timer
/// events from the injected [`Scheduler`] are fed back through
/// [`handle_timer`](Self::handle_timer) by whatever loop owns the manager.
pub struct TranscriptManager {
    config: ScribeConfig,
    clock: Arc<dyn Clock>,
    scheduler: Box<dyn Scheduler>,
    store: BoundedStore,
    session: Option<StreamingSession>,
    session_timer: Option<TimerHandle>,
    gc_timer: Option<TimerHandle>,
    pressure_timer: Option<TimerHandle>,
    notifier: Notifier,
    blob_store: Option<Box<dyn BlobStore>>,
    completion_hooks: Vec<CompletionHook>,
    start_queue: StartQueue,
    is_recording: bool,
    is_processing: bool,
    /// Consecutive high/critical pressure samples.
    pressure_streak: u32,
}

impl TranscriptManager {
    pub fn new(config: ScribeConfig, scheduler: Box<dyn Scheduler>) -> Self {
        let store = BoundedStore::new(config.store.clone());
        Self {
            config,
            clock: Arc::new(SystemClock),
            scheduler,
            store,
            session: None,
            session_timer: None,
            gc_timer: None,
            pressure_timer: None,
            notifier: Notifier::new(),
            blob_store: None,
            completion_hooks: Vec::new(),
            start_queue: StartQueue::default(),
            is_recording: false,
            is_processing: false,
            pressure_streak: 0,
        }
    }

    /// Injects a clock (tests use [`ManualClock`](crate::clock::ManualClock)).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Attaches a persistence medium. Absent, corrupt or failing media
    /// degrade to an in-memory-only store.
    pub fn with_blob_store(mut self, blob_store: Box<dyn BlobStore>) -> Self {
        self.blob_store = Some(blob_store);
        self
    }

    /// Loads persisted history (best effort) and arms the periodic GC and
    /// pressure timers.
    pub fn init(&mut self) {
        self.restore_persisted();
        self.arm_gc_timer();
        self.arm_pressure_timer();
    }

    /// Completes any active session, cancels every timer and writes a final
    /// snapshot.
    pub fn shutdown(&mut self) {
        if self.session.is_some() {
            self.finalize_active(None);
        }
        self.start_queue.clear();
        self.session_timer = None;
        self.gc_timer = None;
        self.pressure_timer = None;
        self.scheduler.cancel_all();
        self.persist();
    }

    // ---- streaming lifecycle ----------------------------------------------

    /// `IDLE → STREAMING`. An already active session is force-completed
    /// first; this is deliberate single-active-session policy.
    pub fn start_streaming(&mut self, fragment: TranscriptFragment) {
        self.start_streaming_inner(fragment);
        self.drain_start_queue();
    }

    /// Applies one fragment to the active session. A partial merges and
    /// re-arms the inactivity timer; a final completes the session with the
    /// longer of the accumulated text and the fragment.
    pub fn update_streaming(&mut self, text: &str, is_partial: bool) {
        let Some(session) = self.session.as_mut() else {
            debug!("update_streaming without active session, dropped");
            return;
        };
        let text = text.trim();
        if text.is_empty() && is_partial {
            return;
        }

        if is_partial {
            let now = self.clock.now_ms();
            let merged = merge::merge_with(
                &self.config.merge,
                &session.accumulated_text,
                &session.last_partial_text,
                text,
            );
            session.apply_update(merged, text, now, &self.config.session);
            // Every partial pushes the deadline out: a session only
            // auto-completes after a true gap in activity.
            let session_id = session.stable_id.clone();
            self.arm_session_timer(&session_id);
            self.emit(EventKind::StreamingUpdated);
        } else {
            let final_text = if session.accumulated_text.len() >= text.len() {
                session.accumulated_text.clone()
            } else {
                text.to_string()
            };
            self.finalize_active(Some(final_text));
            self.drain_start_queue();
        }
    }

    /// Explicit manual completion; same finalization path as a final
    /// fragment, using the accumulated text.
    pub fn complete_streaming(&mut self) {
        if self.session.is_some() {
            self.finalize_active(None);
            self.drain_start_queue();
        }
    }

    /// Discards the active session without creating a record. The inactivity
    /// timer is cancelled synchronously so a stale timeout cannot fire
    /// against a later session.
    pub fn clear_streaming(&mut self) {
        self.cancel_session_timer();
        if self.session.take().is_some() {
            debug!("streaming session discarded");
        }
    }

    /// Dispatches a fired timer back into the engine.
    pub fn handle_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::SessionTimeout { session_id } => {
                let matches = self
                    .session
                    .as_ref()
                    .is_some_and(|s| s.stable_id == session_id);
                if matches {
                    debug!(%session_id, "inactivity timeout, completing session");
                    self.finalize_active(None);
                    self.drain_start_queue();
                } else {
                    debug!(%session_id, "stale session timeout ignored");
                }
            }
            TimerEvent::GcSweep => {
                self.run_gc();
                self.arm_gc_timer();
            }
            TimerEvent::PressureSample => {
                self.sample_pressure();
                self.arm_pressure_timer();
            }
        }
    }

    // ---- observation ------------------------------------------------------

    /// Registers a listener for state-change events.
    pub fn subscribe(
        &self,
        listener: impl FnMut(EventKind, &TranscriptState) + Send + 'static,
    ) -> Subscription {
        self.notifier.subscribe(listener)
    }

    /// Registers a hook run synchronously on every completion, before the
    /// session is cleared. A panicking hook is isolated and logged.
    pub fn on_completion(&mut self, hook: impl FnMut() + Send + 'static) {
        self.completion_hooks.push(Box::new(hook));
    }

    /// Handle for queueing re-entrant starts from completion hooks.
    pub fn start_queue(&self) -> StartQueue {
        self.start_queue.clone()
    }

    /// Defensive copy of the current state; never a live reference.
    pub fn state(&self) -> TranscriptState {
        TranscriptState {
            transcripts: self.store.records().to_vec(),
            streaming: self.session.as_ref().map(StreamingSession::snapshot),
            is_recording: self.is_recording,
            is_processing: self.is_processing,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.session.is_some()
    }

    /// Estimated bytes held by the record history.
    pub fn memory_usage(&self) -> usize {
        self.store.estimated_bytes()
    }

    pub fn memory_stats(&self) -> MemoryStats {
        self.store.stats()
    }

    // ---- store-level operations -------------------------------------------

    /// Inserts an already finalized record (import path), subject to the
    /// same duplicate resolution as streamed completions.
    pub fn add_transcript(&mut self, fragment: TranscriptFragment) {
        let now = self.clock.now_ms();
        let Some(fragment) = fragment.sanitized(now) else {
            debug!("malformed transcript dropped");
            return;
        };
        let record = TranscriptRecord::new(
            fragment.id,
            fragment.text,
            fragment.timestamp,
            fragment.confidence,
            fragment.source,
        );
        if self.store.insert(record, &self.config.dedup) == InsertOutcome::Inserted {
            self.emit(EventKind::TranscriptAdded);
        }
        self.persist();
    }

    /// Drops the whole history.
    pub fn clear_transcripts(&mut self) {
        self.store.clear();
        self.emit(EventKind::TranscriptsCleared);
        self.persist();
    }

    pub fn set_recording(&mut self, recording: bool) {
        if self.is_recording != recording {
            self.is_recording = recording;
            self.emit(EventKind::RecordingChanged);
        }
    }

    pub fn set_processing(&mut self, processing: bool) {
        if self.is_processing != processing {
            self.is_processing = processing;
            self.emit(EventKind::ProcessingChanged);
        }
    }

    // ---- internals --------------------------------------------------------

    fn start_streaming_inner(&mut self, fragment: TranscriptFragment) {
        let now = self.clock.now_ms();
        let Some(fragment) = fragment.sanitized(now) else {
            debug!("malformed start fragment dropped");
            return;
        };
        if self.session.is_some() {
            self.finalize_active(None);
        }
        let session = StreamingSession::new(&fragment, now);
        let session_id = session.stable_id.clone();
        self.session = Some(session);
        self.arm_session_timer(&session_id);
        self.emit(EventKind::StreamingStarted);
    }

    /// Shared finalization path for final fragments, explicit completion,
    /// inactivity timeout and force-completion.
    ///
    /// Order matters: the record is inserted (and `transcript-added`
    /// emitted) first, then completion hooks run while the session still
    /// exists, then the session is cleared and `streaming-completed` fires,
    /// so a subscriber reacting to the completion always sees the record in
    /// the store.
    fn finalize_active(&mut self, final_text: Option<String>) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let text = final_text
            .unwrap_or_else(|| session.accumulated_text.clone())
            .trim()
            .to_string();
        let confidence = session.confidence;
        let source = session.source;

        self.cancel_session_timer();
        let now = self.clock.now_ms();

        if text.is_empty() {
            debug!("session completed with no content, no record created");
        } else {
            let record = TranscriptRecord::new(None, text, now, confidence, source);
            if self.store.insert(record, &self.config.dedup) == InsertOutcome::Inserted {
                self.emit(EventKind::TranscriptAdded);
            }
            self.persist();
        }

        self.run_completion_hooks();
        self.session = None;
        self.emit(EventKind::StreamingCompleted);
    }

    fn run_completion_hooks(&mut self) {
        let mut hooks = std::mem::take(&mut self.completion_hooks);
        for hook in &mut hooks {
            if catch_unwind(AssertUnwindSafe(|| hook())).is_err() {
                error!("completion hook panicked");
            }
        }
        // Hooks registered by other hooks during the run are kept too.
        hooks.append(&mut self.completion_hooks);
        self.completion_hooks = hooks;
    }

    /// Applies starts queued by completion hooks, iteratively. Each applied
    /// start may force-complete the session it just created, whose hooks may
    /// queue again; the depth bound turns a runaway loop into a recoverable
    /// fault that resets the session.
    fn drain_start_queue(&mut self) {
        let mut depth = 0u32;
        while let Some(fragment) = self.start_queue.pop() {
            depth += 1;
            if depth > MAX_COMPLETION_DEPTH {
                let fault = ScribeError::ReentrancyLimit {
                    depth: MAX_COMPLETION_DEPTH,
                };
                warn!(%fault, "discarding queued starts and resetting session");
                self.start_queue.clear();
                self.clear_streaming();
                return;
            }
            self.start_streaming_inner(fragment);
        }
    }

    fn run_gc(&mut self) {
        let now = self.clock.now_ms();

        let aggressive = self.pressure_streak >= 2;
        let report = self.store.run_gc(now, &self.config.dedup, aggressive);
        if report.evicted > 0 || report.duplicates_removed > 0 {
            self.persist();
        }

        // Last pass: a dangling session long past its timeout means the
        // timer was lost; discard rather than finalize minutes-old
        // speculative text.
        let stale = self
            .session
            .as_ref()
            .is_some_and(|s| now - s.last_activity_at > self.config.session.stale_session_ms);
        if stale {
            warn!("discarding stale streaming session during gc");
            self.clear_streaming();
        }
    }

    fn sample_pressure(&mut self) {
        let pressure = self.store.memory_pressure();
        match pressure {
            MemoryPressure::High | MemoryPressure::Critical => {
                self.pressure_streak += 1;
            }
            _ => self.pressure_streak = 0,
        }
        if pressure == MemoryPressure::Critical {
            warn!(streak = self.pressure_streak, "critical memory pressure, tightening cap");
            let now = self.clock.now_ms();
            self.store.set_pressure_cap(true);
            self.store.run_gc(now, &self.config.dedup, true);
            self.store.set_pressure_cap(false);
            self.persist();
        }
    }

    fn restore_persisted(&mut self) {
        let Some(blob_store) = self.blob_store.as_mut() else {
            return;
        };
        let bytes = match blob_store.load() {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "failed to load persisted transcripts, starting empty");
                return;
            }
        };
        match persist::decode(&bytes) {
            Ok(state) => {
                debug!(
                    count = state.transcripts.len(),
                    version = %state.metadata.version,
                    "restored persisted transcripts"
                );
                self.store.load_records(state.transcripts);
            }
            Err(e) => {
                warn!(error = %e, "persisted transcripts corrupt, starting empty");
            }
        }
    }

    /// Fire-and-forget persistence: failures are logged, a capacity error
    /// triggers a keep-newest trim and one retry, and total failure clears
    /// the persisted state rather than crashing.
    fn persist(&mut self) {
        if self.blob_store.is_none() {
            return;
        }
        let now = self.clock.now_ms();
        let bytes = match persist::encode(self.store.records(), now) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "failed to encode transcripts for persistence");
                return;
            }
        };

        match self.save_blob(&bytes) {
            Ok(()) => {}
            Err(ScribeError::PersistCapacity) => {
                warn!("persistence capacity exceeded, trimming to newest and retrying");
                self.store.trim_to_newest(CAPACITY_TRIM_RATIO);
                let retry = persist::encode(self.store.records(), now)
                    .and_then(|bytes| self.save_blob(&bytes));
                if let Err(e) = retry {
                    error!(error = %e, "persistence retry failed, clearing persisted state");
                    if let Ok(empty) = persist::encode(&[], now) {
                        self.save_blob(&empty).ok();
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "persistence write failed");
            }
        }
    }

    fn save_blob(&mut self, bytes: &[u8]) -> crate::error::Result<()> {
        match self.blob_store.as_mut() {
            Some(blob_store) => blob_store.save(bytes),
            None => Ok(()),
        }
    }

    fn emit(&self, event: EventKind) {
        let state = self.state();
        self.notifier.notify(event, &state);
    }

    fn arm_session_timer(&mut self, session_id: &str) {
        self.cancel_session_timer();
        let delay = Duration::from_millis(self.config.session.inactivity_timeout_ms);
        self.session_timer = Some(self.scheduler.schedule(
            delay,
            TimerEvent::SessionTimeout {
                session_id: session_id.to_string(),
            },
        ));
    }

    fn cancel_session_timer(&mut self) {
        if let Some(handle) = self.session_timer.take() {
            self.scheduler.cancel(handle);
        }
    }

    fn arm_gc_timer(&mut self) {
        let delay = Duration::from_millis(self.config.timers.gc_interval_ms);
        self.gc_timer = Some(self.scheduler.schedule(delay, TimerEvent::GcSweep));
    }

    fn arm_pressure_timer(&mut self) {
        let delay = Duration::from_millis(self.config.timers.pressure_interval_ms);
        self.pressure_timer = Some(self.scheduler.schedule(delay, TimerEvent::PressureSample));
    }
}

impl Drop for TranscriptManager {
    fn drop(&mut self) {
        self.scheduler.cancel_all();
    }
}
