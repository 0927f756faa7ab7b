//! Duplicate detection for finalized transcript records.
//!
//! Layered strategies, first match wins:
//! 1. exact id match, authoritative in both directions
//! 2. exact content + timestamp match
//! 3. fuzzy word-set similarity inside a time window (opt-in)

use crate::fragment::TranscriptRecord;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Tunables for duplicate detection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DedupConfig {
    /// Enables the fuzzy word-set strategy. Off by default: it is a full
    /// pairwise text comparison and only worth paying for during GC.
    pub fuzzy: bool,
    /// Two records further apart than this never fuzzy-match.
    pub time_window_ms: i64,
    /// Jaccard similarity at or above this counts as a duplicate.
    pub similarity_threshold: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            fuzzy: false,
            time_window_ms: 5_000,
            similarity_threshold: 0.9,
        }
    }
}

impl DedupConfig {
    /// The GC near-duplicate pass: same thresholds, fuzzy forced on.
    pub fn with_fuzzy(mut self) -> Self {
        self.fuzzy = true;
        self
    }
}

/// Decides whether `candidate` duplicates `existing`.
pub fn is_duplicate(
    candidate: &TranscriptRecord,
    existing: &TranscriptRecord,
    config: &DedupConfig,
) -> bool {
    // Id match is authoritative: equal ids are a duplicate, differing ids
    // short-circuit the exact strategies (fuzzy may still catch re-hashed
    // replays when enabled).
    if !candidate.id.is_empty() && !existing.id.is_empty() {
        if candidate.id == existing.id {
            return true;
        }
        return config.fuzzy && fuzzy_match(candidate, existing, config);
    }

    if candidate.text == existing.text && candidate.timestamp == existing.timestamp {
        return true;
    }

    config.fuzzy && fuzzy_match(candidate, existing, config)
}

/// Whether the candidate of a duplicate pair should replace the existing
/// record: higher confidence wins, ties keep the existing one.
pub fn candidate_preferred(candidate: &TranscriptRecord, existing: &TranscriptRecord) -> bool {
    candidate.confidence.unwrap_or(0.0) > existing.confidence.unwrap_or(0.0)
}

fn fuzzy_match(a: &TranscriptRecord, b: &TranscriptRecord, config: &DedupConfig) -> bool {
    if (a.timestamp - b.timestamp).abs() > config.time_window_ms {
        return false;
    }
    jaccard_similarity(&a.text, &b.text) >= config.similarity_threshold
}

/// Word-set Jaccard similarity, case-insensitive. Empty inputs yield 0.
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let set_a: HashSet<String> = a.split_whitespace().map(str::to_lowercase).collect();
    let set_b: HashSet<String> = b.split_whitespace().map(str::to_lowercase).collect();
    if set_a.is_empty() && set_b.is_empty() {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    intersection as f64 / union as f64
}
