//! The single active streaming session.

use crate::config::SessionConfig;
use crate::fragment::{TranscriptFragment, TranscriptSource, derive_record_id};
use serde::Serialize;
use std::collections::VecDeque;

/// Public, copyable view of the active session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamingSnapshot {
    pub stable_id: String,
    pub accumulated_text: String,
    pub last_partial_text: String,
    pub started_at: i64,
    pub last_activity_at: i64,
}

/// Mutable state of the one active stream. Owned exclusively by the
/// lifecycle state machine; created on start, destroyed on
/// completion/clear/timeout.
#[derive(Debug)]
pub struct StreamingSession {
    pub stable_id: String,
    pub accumulated_text: String,
    pub last_partial_text: String,
    /// Accumulated-text history after each merge, most recent last. Capped;
    /// purely diagnostic, never read by downstream logic.
    pub snapshots: VecDeque<String>,
    /// Raw fragments as they arrived. Capped; diagnostic only.
    pub raw_fragment_log: VecDeque<String>,
    pub started_at: i64,
    pub last_activity_at: i64,
    /// Carried from the starting fragment into the finalized record.
    pub source: TranscriptSource,
    pub confidence: Option<f32>,
}

impl StreamingSession {
    /// Opens a session seeded with the starting fragment.
    pub fn new(fragment: &TranscriptFragment, now_ms: i64) -> Self {
        let stable_id = match &fragment.id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => format!(
                "stream-{}",
                derive_record_id(
                    &fragment.text,
                    fragment.timestamp,
                    fragment.source,
                    fragment.confidence
                )
            ),
        };
        let mut session = Self {
            stable_id,
            accumulated_text: fragment.text.clone(),
            last_partial_text: fragment.text.clone(),
            snapshots: VecDeque::new(),
            raw_fragment_log: VecDeque::new(),
            started_at: now_ms,
            last_activity_at: now_ms,
            source: fragment.source,
            confidence: fragment.confidence,
        };
        session.raw_fragment_log.push_back(fragment.text.clone());
        session
    }

    /// Applies a merged partial update.
    pub fn apply_update(
        &mut self,
        merged: String,
        partial_text: &str,
        now_ms: i64,
        config: &SessionConfig,
    ) {
        self.record_snapshot(&merged, config.snapshot_cap);
        self.accumulated_text = merged;
        self.last_partial_text = partial_text.to_string();
        self.last_activity_at = now_ms;
        self.push_raw(partial_text, config.raw_log_cap);
    }

    /// Appends to the snapshot history if the text actually changed.
    fn record_snapshot(&mut self, merged: &str, cap: usize) {
        if cap == 0 {
            return;
        }
        if self.snapshots.back().is_some_and(|s| s == merged) {
            return;
        }
        if self.snapshots.len() == cap {
            self.snapshots.pop_front();
        }
        self.snapshots.push_back(merged.to_string());
    }

    fn push_raw(&mut self, text: &str, cap: usize) {
        if cap == 0 {
            return;
        }
        if self.raw_fragment_log.len() == cap {
            self.raw_fragment_log.pop_front();
        }
        self.raw_fragment_log.push_back(text.to_string());
    }

    /// Defensive copy for subscribers.
    pub fn snapshot(&self) -> StreamingSnapshot {
        StreamingSnapshot {
            stable_id: self.stable_id.clone(),
            accumulated_text: self.accumulated_text.clone(),
            last_partial_text: self.last_partial_text.clone(),
            started_at: self.started_at,
            last_activity_at: self.last_activity_at,
        }
    }
}
