//! Synchronous publish/subscribe fan-out with per-listener fault isolation.
//!
//! Listeners are invoked over a copy of the registry taken before iteration,
//! so a listener unsubscribing itself (or anyone else) mid-notification
//! cannot corrupt the walk. A panicking listener is caught and logged; the
//! remaining listeners still run. A listener that notifies re-entrantly is
//! skipped for the nested round, never deadlocked.

use crate::fragment::TranscriptRecord;
use crate::session::StreamingSnapshot;
use serde::Serialize;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError, TryLockError, Weak};
use tracing::{error, warn};

/// State-change events delivered to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    StreamingStarted,
    StreamingUpdated,
    StreamingCompleted,
    TranscriptAdded,
    TranscriptsCleared,
    RecordingChanged,
    ProcessingChanged,
}

impl EventKind {
    /// Wire-style kebab-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::StreamingStarted => "streaming-started",
            EventKind::StreamingUpdated => "streaming-updated",
            EventKind::StreamingCompleted => "streaming-completed",
            EventKind::TranscriptAdded => "transcript-added",
            EventKind::TranscriptsCleared => "transcripts-cleared",
            EventKind::RecordingChanged => "recording-changed",
            EventKind::ProcessingChanged => "processing-changed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Defensive snapshot handed to listeners and returned by `state()`.
/// Never a live reference into the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct TranscriptState {
    pub transcripts: Vec<TranscriptRecord>,
    pub streaming: Option<StreamingSnapshot>,
    pub is_recording: bool,
    pub is_processing: bool,
}

type ListenerFn = Box<dyn FnMut(EventKind, &TranscriptState) + Send>;

struct Entry {
    id: u64,
    listener: Arc<Mutex<ListenerFn>>,
}

#[derive(Default)]
struct Registry {
    entries: Vec<Entry>,
    next_id: u64,
}

/// Listener registry with synchronous fan-out.
#[derive(Clone, Default)]
pub struct Notifier {
    registry: Arc<Mutex<Registry>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener. Dropping the returned subscription (or calling
    /// `unsubscribe`) removes it.
    pub fn subscribe(
        &self,
        listener: impl FnMut(EventKind, &TranscriptState) + Send + 'static,
    ) -> Subscription {
        let mut registry = lock_registry(&self.registry);
        let id = registry.next_id;
        registry.next_id += 1;
        registry.entries.push(Entry {
            id,
            listener: Arc::new(Mutex::new(Box::new(listener))),
        });
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Delivers one event to every listener subscribed at the start of the
    /// call.
    pub fn notify(&self, event: EventKind, state: &TranscriptState) {
        // Copy-before-iterate: the registry lock is not held while listeners
        // run, so they may freely subscribe or unsubscribe.
        let entries: Vec<Arc<Mutex<ListenerFn>>> = {
            let registry = lock_registry(&self.registry);
            registry.entries.iter().map(|e| Arc::clone(&e.listener)).collect()
        };

        for listener in entries {
            // A held lock means this listener is already running further up
            // the stack (it notified re-entrantly); skip it rather than
            // self-deadlock.
            let mut guard = match listener.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => {
                    warn!(event = %event, "listener busy, re-entrant notification skipped");
                    continue;
                }
            };
            let result = catch_unwind(AssertUnwindSafe(|| (*guard)(event, state)));
            if result.is_err() {
                error!(event = %event, "listener panicked during notification");
            }
        }
    }

    pub fn listener_count(&self) -> usize {
        lock_registry(&self.registry).entries.len()
    }
}

fn lock_registry(registry: &Arc<Mutex<Registry>>) -> std::sync::MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes its listener when dropped or explicitly unsubscribed.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    /// Removes the listener now.
    pub fn unsubscribe(self) {
        // Drop does the work.
    }

    /// Keeps the listener registered for the lifetime of the notifier.
    pub fn detach(mut self) {
        self.registry = Weak::new();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut registry = lock_registry(&registry);
            registry.entries.retain(|e| e.id != self.id);
        }
    }
}
