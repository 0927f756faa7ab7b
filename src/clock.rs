//! Injectable wall-clock abstraction.
//!
//! Record timestamps and eviction recency scoring both need "now" in epoch
//! milliseconds; injecting it keeps timeout and GC behavior deterministic
//! under test.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Source of the current time in epoch milliseconds.
pub trait Clock: Send + Sync {
    /// Returns the current time as milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;
}

/// Real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Manually advanced clock for tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    current_ms: AtomicI64,
}

impl ManualClock {
    /// Creates a clock starting at the given epoch millisecond.
    pub fn new(start_ms: i64) -> Arc<Self> {
        Arc::new(Self {
            current_ms: AtomicI64::new(start_ms),
        })
    }

    /// Advances the clock by `delta_ms` milliseconds.
    pub fn advance(&self, delta_ms: i64) {
        self.current_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    /// Sets the clock to an absolute epoch millisecond.
    pub fn set(&self, now_ms: i64) {
        self.current_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.current_ms.load(Ordering::SeqCst)
    }
}
