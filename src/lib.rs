//! scribe - streaming transcript reconciliation with a bounded history
//!
//! Ingests partial and final speech-to-text fragments from an external
//! transport, merges them into a coherent running transcript, deduplicates
//! finalized records and keeps the history under explicit record and byte
//! budgets with priority-based eviction.
//!
//! The caller constructs and owns a [`TranscriptManager`], injects a
//! [`Scheduler`] for timers and optionally a [`BlobStore`] for best-effort
//! persistence, and feeds fragments via `start_streaming` /
//! `update_streaming` / `complete_streaming`. Subscribers receive
//! synchronous state-change events with defensive snapshots.

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod clock;
pub mod config;
pub mod dedup;
pub mod error;
pub mod fragment;
pub mod manager;
pub mod merge;
pub mod notify;
pub mod persist;
pub mod scheduler;
pub mod session;
pub mod store;

// Core engine
pub use manager::{StartQueue, TranscriptManager};

// Data model
pub use fragment::{TranscriptFragment, TranscriptRecord, TranscriptSource};
pub use session::StreamingSnapshot;

// Merging and duplicate detection
pub use dedup::{DedupConfig, is_duplicate, jaccard_similarity};
pub use merge::{MergeConfig, merge, merge_with};

// Bounded store
pub use store::{BoundedStore, InsertOutcome, MemoryPressure, MemoryStats, StoreConfig};

// Events and subscriptions
pub use notify::{EventKind, Notifier, Subscription, TranscriptState};

// Injected collaborators
pub use clock::{Clock, ManualClock, SystemClock};
pub use persist::{BlobStore, FileBlobStore, MemoryBlobStore};
pub use scheduler::{ManualScheduler, Scheduler, TimerEvent, TimerHandle, TokioScheduler};

// Error handling
pub use error::{Result, ScribeError};

// Config
pub use config::{ScribeConfig, SessionConfig, TimerConfig};
