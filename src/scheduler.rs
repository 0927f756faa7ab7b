//! Injected timer scheduling.
//!
//! Timers are not ambient state: the engine asks a [`Scheduler`] to deliver a
//! [`TimerEvent`] after a delay, and the owner dispatches delivered events
//! back into the engine. [`ManualScheduler`] makes timeout behavior
//! deterministic in tests; [`TokioScheduler`] drives real time.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

/// What a fired timer means to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    /// The inactivity timeout of the named session elapsed.
    SessionTimeout { session_id: String },
    /// Periodic garbage collection sweep.
    GcSweep,
    /// Periodic memory pressure sample.
    PressureSample,
}

/// Cancellation handle for a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

/// One-shot timer source. Periodic timers are re-armed by the engine when
/// the previous shot fires.
pub trait Scheduler: Send {
    /// Arms a one-shot timer delivering `event` after `delay`.
    fn schedule(&mut self, delay: Duration, event: TimerEvent) -> TimerHandle;

    /// Cancels a pending timer; a handle that already fired is ignored.
    fn cancel(&mut self, handle: TimerHandle);

    /// Cancels everything (teardown).
    fn cancel_all(&mut self);
}

/// Forwarding impl so an owner and the engine can share one scheduler
/// (the engine takes `Arc<Mutex<ManualScheduler>>` and the test keeps a
/// clone to advance).
impl<S: Scheduler> Scheduler for std::sync::Arc<std::sync::Mutex<S>> {
    fn schedule(&mut self, delay: Duration, event: TimerEvent) -> TimerHandle {
        lock_shared(self).schedule(delay, event)
    }

    fn cancel(&mut self, handle: TimerHandle) {
        lock_shared(self).cancel(handle);
    }

    fn cancel_all(&mut self) {
        lock_shared(self).cancel_all();
    }
}

fn lock_shared<S>(shared: &std::sync::Arc<std::sync::Mutex<S>>) -> std::sync::MutexGuard<'_, S> {
    shared.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

struct PendingTimer {
    handle: TimerHandle,
    deadline: Duration,
    event: TimerEvent,
}

/// Deterministic scheduler driven by an explicit `advance` call.
#[derive(Default)]
pub struct ManualScheduler {
    now: Duration,
    pending: Vec<PendingTimer>,
    next_id: u64,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves virtual time forward and returns the events that came due, in
    /// deadline order (arming order breaks ties).
    pub fn advance(&mut self, delta: Duration) -> Vec<TimerEvent> {
        self.now += delta;
        let now = self.now;
        let mut due: Vec<PendingTimer> = Vec::new();
        let mut remaining: Vec<PendingTimer> = Vec::new();
        for timer in self.pending.drain(..) {
            if timer.deadline <= now {
                due.push(timer);
            } else {
                remaining.push(timer);
            }
        }
        self.pending = remaining;
        due.sort_by_key(|t| (t.deadline, t.handle.0));
        due.into_iter().map(|t| t.event).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Virtual time elapsed so far.
    pub fn now(&self) -> Duration {
        self.now
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&mut self, delay: Duration, event: TimerEvent) -> TimerHandle {
        let handle = TimerHandle(self.next_id);
        self.next_id += 1;
        self.pending.push(PendingTimer {
            handle,
            deadline: self.now + delay,
            event,
        });
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) {
        self.pending.retain(|t| t.handle != handle);
    }

    fn cancel_all(&mut self) {
        self.pending.clear();
    }
}

/// Scheduler backed by tokio timers. Fired events arrive on the receiver
/// returned by [`TokioScheduler::new`]; the owner forwards them into the
/// engine. Must be constructed inside a tokio runtime.
pub struct TokioScheduler {
    tx: mpsc::UnboundedSender<TimerEvent>,
    tasks: HashMap<u64, tokio::task::JoinHandle<()>>,
    next_id: u64,
}

impl TokioScheduler {
    /// Creates the scheduler and the channel its fired events arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                tasks: HashMap::new(),
                next_id: 0,
            },
            rx,
        )
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&mut self, delay: Duration, event: TimerEvent) -> TimerHandle {
        // Opportunistic cleanup of fired timers.
        self.tasks.retain(|_, task| !task.is_finished());

        let id = self.next_id;
        self.next_id += 1;
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Receiver gone means the engine was torn down.
            tx.send(event).ok();
        });
        self.tasks.insert(id, task);
        TimerHandle(id)
    }

    fn cancel(&mut self, handle: TimerHandle) {
        if let Some(task) = self.tasks.remove(&handle.0) {
            task.abort();
        }
    }

    fn cancel_all(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
