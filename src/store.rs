//! Bounded transcript store with priority-based eviction.
//!
//! Records accumulate in insertion order; a periodic GC pass keeps the store
//! under its record and byte budgets by dropping the lowest-priority records
//! first. Priority is a weighted blend of recency, confidence, content length
//! and completeness, so a short, recent, low-confidence transcript can be
//! evicted before an older, longer, high-confidence one.

use crate::dedup::{self, DedupConfig};
use crate::fragment::TranscriptRecord;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

const SEVEN_DAYS_MS: f64 = 7.0 * 24.0 * 60.0 * 60.0 * 1000.0;

/// Size and eviction tunables for the bounded store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// Hard cap on record count.
    pub max_records: usize,
    /// Hard cap on estimated bytes.
    pub max_bytes: usize,
    /// A triggered cleanup evicts down to this fraction of the cap.
    pub evict_target_ratio: f64,
    /// Under sustained memory pressure, evict down to this fraction instead.
    pub pressure_target_ratio: f64,
    /// Critical pressure temporarily tightens the cap to this fraction.
    pub critical_cap_ratio: f64,
    /// Records longer than this many chars are compressed in place by GC.
    pub compress_threshold_chars: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_records: 1_000,
            max_bytes: 5 * 1024 * 1024,
            evict_target_ratio: 0.8,
            pressure_target_ratio: 0.6,
            critical_cap_ratio: 0.3,
            compress_threshold_chars: 2_000,
        }
    }
}

/// Coarse memory pressure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryPressure {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for MemoryPressure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MemoryPressure::Low => "low",
            MemoryPressure::Medium => "medium",
            MemoryPressure::High => "high",
            MemoryPressure::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// Store size snapshot for dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MemoryStats {
    pub record_count: usize,
    pub estimated_bytes: usize,
    pub max_records: usize,
    /// Current cap after any pressure tightening.
    pub effective_max_records: usize,
    pub max_bytes: usize,
    pub pressure: MemoryPressure,
}

/// What happened to an inserted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// New record appended.
    Inserted,
    /// Duplicate found and the candidate had higher confidence: replaced the
    /// existing record in place.
    Replaced,
    /// Duplicate found, existing record kept; nothing changed.
    Duplicate,
}

/// Counters from one GC cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    pub evicted: usize,
    pub duplicates_removed: usize,
    pub compressed: usize,
}

impl GcReport {
    pub fn is_noop(&self) -> bool {
        *self == GcReport::default()
    }
}

/// Ordered history of finalized records under record and byte budgets.
#[derive(Debug)]
pub struct BoundedStore {
    records: Vec<TranscriptRecord>,
    estimated_bytes: usize,
    config: StoreConfig,
    effective_max_records: usize,
}

impl BoundedStore {
    pub fn new(config: StoreConfig) -> Self {
        let effective_max_records = config.max_records;
        Self {
            records: Vec::new(),
            estimated_bytes: 0,
            config,
            effective_max_records,
        }
    }

    /// Records in insertion order.
    pub fn records(&self) -> &[TranscriptRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn estimated_bytes(&self) -> usize {
        self.estimated_bytes
    }

    /// Inserts a record, resolving duplicates against the existing history.
    ///
    /// On a duplicate the higher-confidence record wins (ties keep the
    /// existing one); no new entry is ever created for a duplicate. Bounds
    /// are enforced by the periodic GC pass, not per insert.
    pub fn insert(&mut self, record: TranscriptRecord, config: &DedupConfig) -> InsertOutcome {
        for existing in &mut self.records {
            if dedup::is_duplicate(&record, existing, config) {
                if dedup::candidate_preferred(&record, existing) {
                    debug!(id = %record.id, "duplicate replaced by higher-confidence record");
                    self.estimated_bytes = self
                        .estimated_bytes
                        .saturating_sub(existing.estimated_bytes())
                        .saturating_add(record.estimated_bytes());
                    *existing = record;
                    return InsertOutcome::Replaced;
                }
                debug!(id = %record.id, "duplicate ignored, existing record kept");
                return InsertOutcome::Duplicate;
            }
        }
        self.estimated_bytes = self.estimated_bytes.saturating_add(record.estimated_bytes());
        self.records.push(record);
        InsertOutcome::Inserted
    }

    /// Drops everything.
    pub fn clear(&mut self) {
        self.records.clear();
        self.estimated_bytes = 0;
    }

    /// Replaces the whole history (persistence restore). Oldest records are
    /// dropped if the snapshot exceeds the cap.
    pub fn load_records(&mut self, mut records: Vec<TranscriptRecord>) {
        if records.len() > self.config.max_records {
            let excess = records.len() - self.config.max_records;
            warn!(excess, "persisted snapshot over cap, dropping oldest records");
            records.drain(..excess);
        }
        self.estimated_bytes = records.iter().map(TranscriptRecord::estimated_bytes).sum();
        self.records = records;
        self.enforce_byte_budget(0);
    }

    /// Evicts lowest-priority records until at or below `target_records` and
    /// the byte budget. Insertion order of survivors is preserved.
    pub fn evict(&mut self, target_records: usize, now_ms: i64) -> usize {
        if self.records.len() <= target_records && self.estimated_bytes <= self.config.max_bytes {
            return 0;
        }

        let mut order: Vec<usize> = (0..self.records.len()).collect();
        order.sort_by(|&a, &b| {
            let score_a = priority_score(&self.records[a], now_ms);
            let score_b = priority_score(&self.records[b], now_ms);
            score_a.total_cmp(&score_b)
        });

        let mut drop = vec![false; self.records.len()];
        let mut remaining = self.records.len();
        let mut remaining_bytes = self.estimated_bytes;
        for &idx in &order {
            if remaining <= target_records && remaining_bytes <= self.config.max_bytes {
                break;
            }
            drop[idx] = true;
            remaining -= 1;
            remaining_bytes = remaining_bytes.saturating_sub(self.records[idx].estimated_bytes());
        }

        let before = self.records.len();
        let mut idx = 0;
        self.records.retain(|_| {
            let keep = !drop[idx];
            idx += 1;
            keep
        });
        self.estimated_bytes = remaining_bytes;
        before - self.records.len()
    }

    /// One full GC cycle: priority eviction, fuzzy near-duplicate removal,
    /// then in-place compression of over-long records. Bounds hold when this
    /// returns, even if they were exceeded mid-pass.
    pub fn run_gc(&mut self, now_ms: i64, dedup: &DedupConfig, aggressive: bool) -> GcReport {
        let mut report = GcReport::default();

        let target_ratio = if aggressive {
            self.config.pressure_target_ratio
        } else {
            self.config.evict_target_ratio
        };
        if self.records.len() > self.effective_max_records
            || self.estimated_bytes > self.config.max_bytes
        {
            let target = target_records(self.effective_max_records, target_ratio);
            report.evicted = self.evict(target, now_ms);
        }

        report.duplicates_removed = self.remove_near_duplicates(&dedup.clone().with_fuzzy());
        report.compressed = self.compress_long_records();

        // Compression only shrinks, but a replaced-in-place duplicate can in
        // principle leave bytes over budget; restore the invariant.
        report.evicted += self.enforce_byte_budget(now_ms);

        if !report.is_noop() {
            debug!(
                evicted = report.evicted,
                duplicates_removed = report.duplicates_removed,
                compressed = report.compressed,
                records = self.records.len(),
                bytes = self.estimated_bytes,
                "gc cycle finished"
            );
        }
        report
    }

    /// Tightens or restores the record cap in response to pressure.
    /// Critical pressure temporarily reduces the cap before eviction runs.
    pub fn set_pressure_cap(&mut self, critical: bool) {
        let tightened = target_records(self.config.max_records, self.config.critical_cap_ratio);
        let new_cap = if critical { tightened } else { self.config.max_records };
        if new_cap != self.effective_max_records {
            warn!(
                from = self.effective_max_records,
                to = new_cap,
                "adjusting record cap for memory pressure"
            );
            self.effective_max_records = new_cap;
        }
    }

    /// Current pressure tier from record and byte utilization, whichever is
    /// tighter.
    pub fn memory_pressure(&self) -> MemoryPressure {
        let record_ratio = self.records.len() as f64 / self.effective_max_records.max(1) as f64;
        let byte_ratio = self.estimated_bytes as f64 / self.config.max_bytes.max(1) as f64;
        let ratio = record_ratio.max(byte_ratio);
        if ratio < 0.5 {
            MemoryPressure::Low
        } else if ratio < 0.75 {
            MemoryPressure::Medium
        } else if ratio < 0.9 {
            MemoryPressure::High
        } else {
            MemoryPressure::Critical
        }
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            record_count: self.records.len(),
            estimated_bytes: self.estimated_bytes,
            max_records: self.config.max_records,
            effective_max_records: self.effective_max_records,
            max_bytes: self.config.max_bytes,
            pressure: self.memory_pressure(),
        }
    }

    /// Keeps only the newest `ratio` fraction of records (persistence
    /// capacity fallback).
    pub fn trim_to_newest(&mut self, ratio: f64) -> usize {
        let keep = target_records(self.records.len(), ratio).max(1);
        if self.records.len() <= keep {
            return 0;
        }
        let dropped = self.records.len() - keep;
        self.records.drain(..dropped);
        self.estimated_bytes = self
            .records
            .iter()
            .map(TranscriptRecord::estimated_bytes)
            .sum();
        dropped
    }

    fn remove_near_duplicates(&mut self, fuzzy: &DedupConfig) -> usize {
        let mut drop = vec![false; self.records.len()];
        for i in 0..self.records.len() {
            if drop[i] {
                continue;
            }
            for j in (i + 1)..self.records.len() {
                if drop[j] {
                    continue;
                }
                if dedup::is_duplicate(&self.records[j], &self.records[i], fuzzy) {
                    // Keep the preferred record in the earlier slot.
                    if dedup::candidate_preferred(&self.records[j], &self.records[i]) {
                        self.records.swap(i, j);
                    }
                    drop[j] = true;
                }
            }
        }
        let before = self.records.len();
        let mut idx = 0;
        self.records.retain(|_| {
            let keep = !drop[idx];
            idx += 1;
            keep
        });
        let removed = before - self.records.len();
        if removed > 0 {
            self.estimated_bytes = self
                .records
                .iter()
                .map(TranscriptRecord::estimated_bytes)
                .sum();
        }
        removed
    }

    fn compress_long_records(&mut self) -> usize {
        let threshold = self.config.compress_threshold_chars;
        let mut compressed = 0;
        for record in &mut self.records {
            if let Some(shorter) = compress_text(&record.text, threshold) {
                self.estimated_bytes = self
                    .estimated_bytes
                    .saturating_sub(record.estimated_bytes());
                record.text = shorter;
                self.estimated_bytes = self
                    .estimated_bytes
                    .saturating_add(record.estimated_bytes());
                compressed += 1;
            }
        }
        compressed
    }

    fn enforce_byte_budget(&mut self, now_ms: i64) -> usize {
        if self.estimated_bytes <= self.config.max_bytes {
            return 0;
        }
        self.evict(self.records.len().saturating_sub(1), now_ms)
    }
}

fn target_records(cap: usize, ratio: f64) -> usize {
    ((cap as f64 * ratio).floor() as usize).min(cap)
}

/// Eviction priority: higher scores survive longer.
///
/// recency 0..40 (linear decay over 7 days) + confidence 0..30 + length 0..20
/// (capped) + completeness bonus 10.
pub fn priority_score(record: &TranscriptRecord, now_ms: i64) -> f64 {
    let age_ms = (now_ms - record.timestamp).max(0) as f64;
    let recency = 40.0 * (1.0 - age_ms / SEVEN_DAYS_MS).clamp(0.0, 1.0);
    let confidence = f64::from(record.confidence.unwrap_or(0.5)) * 30.0;
    let length = (record.text.len() as f64 / 50.0).min(20.0);
    let completeness = if record.metadata.is_some() { 10.0 } else { 0.0 };
    recency + confidence + length + completeness
}

/// Replaces the interior of an over-long text with a marker, keeping head and
/// tail. Returns `None` when the text is already within the threshold.
fn compress_text(text: &str, threshold_chars: usize) -> Option<String> {
    let total = text.chars().count();
    if threshold_chars == 0 || total <= threshold_chars {
        return None;
    }
    let head_chars = threshold_chars * 3 / 5;
    let tail_chars = threshold_chars * 3 / 10;
    let head_end = char_boundary_at(text, head_chars);
    let tail_start = char_boundary_at(text, total - tail_chars);
    Some(format!(
        "{} [truncated] {}",
        text[..head_end].trim_end(),
        text[tail_start..].trim_start()
    ))
}

/// Byte offset of the `n`-th char, or the full length past the end.
fn char_boundary_at(text: &str, n: usize) -> usize {
    text.char_indices().nth(n).map_or(text.len(), |(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::TranscriptSource;

    fn record(id: &str, text: &str, timestamp: i64, confidence: Option<f32>) -> TranscriptRecord {
        TranscriptRecord {
            id: id.to_string(),
            text: text.to_string(),
            timestamp,
            confidence,
            source: TranscriptSource::Microphone,
            metadata: None,
        }
    }

    fn small_store(max_records: usize) -> BoundedStore {
        BoundedStore::new(StoreConfig {
            max_records,
            ..StoreConfig::default()
        })
    }

    #[test]
    fn test_insert_appends_in_order() {
        let mut store = small_store(10);
        let dedup = DedupConfig::default();
        assert_eq!(store.insert(record("a", "one", 1, None), &dedup), InsertOutcome::Inserted);
        assert_eq!(store.insert(record("b", "two", 2, None), &dedup), InsertOutcome::Inserted);
        assert_eq!(store.records()[0].id, "a");
        assert_eq!(store.records()[1].id, "b");
        assert_eq!(
            store.estimated_bytes(),
            store.records().iter().map(|r| r.estimated_bytes()).sum::<usize>()
        );
    }

    #[test]
    fn test_insert_duplicate_keeps_higher_confidence() {
        let mut store = small_store(10);
        let dedup = DedupConfig::default();
        store.insert(record("a", "hello", 1, Some(0.5)), &dedup);

        // Lower confidence candidate: ignored.
        assert_eq!(
            store.insert(record("a", "hello again", 1, Some(0.3)), &dedup),
            InsertOutcome::Duplicate
        );
        assert_eq!(store.records()[0].text, "hello");

        // Higher confidence candidate: replaces in place.
        assert_eq!(
            store.insert(record("a", "hello refined", 1, Some(0.9)), &dedup),
            InsertOutcome::Replaced
        );
        assert_eq!(store.len(), 1);
        assert_eq!(store.records()[0].text, "hello refined");
    }

    #[test]
    fn test_evict_respects_priority_not_fifo() {
        let mut store = small_store(2);
        let dedup = DedupConfig::default();
        let now = SEVEN_DAYS_MS as i64;

        // Older but long and high-confidence.
        let keeper = record(
            "keeper",
            &"important words ".repeat(40),
            now - 3_600_000,
            Some(0.95),
        );
        // Newer but short and low-confidence.
        let victim = record("victim", "uh", now - 1_000, Some(0.05));
        store.insert(keeper, &dedup);
        store.insert(victim, &dedup);

        store.evict(1, now);
        assert_eq!(store.len(), 1);
        assert_eq!(store.records()[0].id, "keeper");
    }

    #[test]
    fn test_evict_preserves_insertion_order_of_survivors() {
        let mut store = small_store(10);
        let dedup = DedupConfig::default();
        let now = 1_000_000;
        store.insert(record("a", &"x".repeat(500), now, Some(0.9)), &dedup);
        store.insert(record("b", "y", now, Some(0.01)), &dedup);
        store.insert(record("c", &"z".repeat(500), now, Some(0.9)), &dedup);
        store.evict(2, now);
        let ids: Vec<&str> = store.records().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn test_gc_bounds_invariant() {
        let mut store = BoundedStore::new(StoreConfig {
            max_records: 20,
            max_bytes: 4_000,
            ..StoreConfig::default()
        });
        let dedup = DedupConfig::default();
        for i in 0..100 {
            store.insert(
                record(&format!("r{i}"), &format!("segment {i} ").repeat(10), i, Some(0.5)),
                &dedup,
            );
        }
        store.run_gc(100, &dedup, false);
        assert!(store.len() <= 20);
        assert!(store.estimated_bytes() <= 4_000);
    }

    #[test]
    fn test_gc_evicts_to_target_ratio() {
        let mut store = small_store(10);
        let dedup = DedupConfig::default();
        for i in 0..15 {
            store.insert(
                record(&format!("r{i}"), &format!("utterance number {i}"), i, Some(0.5)),
                &dedup,
            );
        }
        store.run_gc(100, &dedup, false);
        // 80% of 10
        assert_eq!(store.len(), 8);

        for i in 15..30 {
            store.insert(
                record(&format!("r{i}"), &format!("utterance number {i}"), i, Some(0.5)),
                &dedup,
            );
        }
        store.run_gc(100, &dedup, true);
        // Aggressive: 60% of 10
        assert_eq!(store.len(), 6);
    }

    #[test]
    fn test_gc_removes_near_duplicates() {
        let mut store = small_store(10);
        let dedup = DedupConfig::default();
        store.insert(record("a", "the quick brown fox", 1_000, Some(0.4)), &dedup);
        store.insert(record("b", "the quick brown fox", 2_000, Some(0.8)), &dedup);
        store.insert(record("c", "something else entirely", 3_000, None), &dedup);
        assert_eq!(store.len(), 3);

        let report = store.run_gc(10_000, &dedup, false);
        assert_eq!(report.duplicates_removed, 1);
        assert_eq!(store.len(), 2);
        // Higher-confidence duplicate survives.
        assert!(store.records().iter().any(|r| r.id == "b"));
        assert!(store.records().iter().any(|r| r.id == "c"));
    }

    #[test]
    fn test_gc_compresses_long_records() {
        let mut store = small_store(10);
        let dedup = DedupConfig::default();
        let long_text = "a".repeat(5_000);
        store.insert(record("long", &long_text, 1_000, None), &dedup);

        let report = store.run_gc(2_000, &dedup, false);
        assert_eq!(report.compressed, 1);
        let text = &store.records()[0].text;
        assert!(text.contains("[truncated]"));
        assert!(text.chars().count() < 5_000);
        assert!(text.starts_with('a'));
        assert!(text.ends_with('a'));
    }

    #[test]
    fn test_pressure_tiers() {
        let mut store = small_store(100);
        let dedup = DedupConfig::default();
        assert_eq!(store.memory_pressure(), MemoryPressure::Low);

        for i in 0..60 {
            store.insert(record(&format!("r{i}"), "t", i, None), &dedup);
        }
        assert_eq!(store.memory_pressure(), MemoryPressure::Medium);

        for i in 60..80 {
            store.insert(record(&format!("r{i}"), "t", i, None), &dedup);
        }
        assert_eq!(store.memory_pressure(), MemoryPressure::High);

        for i in 80..95 {
            store.insert(record(&format!("r{i}"), "t", i, None), &dedup);
        }
        assert_eq!(store.memory_pressure(), MemoryPressure::Critical);
    }

    #[test]
    fn test_critical_pressure_tightens_cap() {
        let mut store = small_store(100);
        let dedup = DedupConfig::default();
        for i in 0..95 {
            store.insert(record(&format!("r{i}"), &format!("note {i}"), i, Some(0.5)), &dedup);
        }
        store.set_pressure_cap(true);
        assert_eq!(store.stats().effective_max_records, 30);
        store.run_gc(100, &dedup, true);
        // 60% of the tightened cap of 30
        assert_eq!(store.len(), 18);

        store.set_pressure_cap(false);
        assert_eq!(store.stats().effective_max_records, 100);
    }

    #[test]
    fn test_trim_to_newest() {
        let mut store = small_store(100);
        let dedup = DedupConfig::default();
        for i in 0..10 {
            store.insert(record(&format!("r{i}"), "t", i, None), &dedup);
        }
        let dropped = store.trim_to_newest(0.2);
        assert_eq!(dropped, 8);
        assert_eq!(store.len(), 2);
        assert_eq!(store.records()[0].id, "r8");
        assert_eq!(store.records()[1].id, "r9");
    }

    #[test]
    fn test_load_records_over_cap_keeps_newest() {
        let mut store = small_store(3);
        let records: Vec<_> = (0..5).map(|i| record(&format!("r{i}"), "t", i, None)).collect();
        store.load_records(records);
        assert_eq!(store.len(), 3);
        assert_eq!(store.records()[0].id, "r2");
    }

    #[test]
    fn test_clear() {
        let mut store = small_store(10);
        store.insert(record("a", "one", 1, None), &DedupConfig::default());
        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.estimated_bytes(), 0);
    }

    #[test]
    fn test_priority_score_components() {
        let now = SEVEN_DAYS_MS as i64 * 2;
        let fresh = record("f", "some reasonable text", now, Some(1.0));
        let stale = record("s", "some reasonable text", now - SEVEN_DAYS_MS as i64, Some(1.0));
        assert!(priority_score(&fresh, now) > priority_score(&stale, now));

        let confident = record("c", "text", now, Some(0.9));
        let unsure = record("u", "text", now, Some(0.1));
        assert!(priority_score(&confident, now) > priority_score(&unsure, now));

        let with_meta = record("m", "text", now, Some(0.5))
            .with_metadata(serde_json::json!({"audio": "clip.wav"}));
        let without = record("w", "text", now, Some(0.5));
        let diff = priority_score(&with_meta, now) - priority_score(&without, now);
        assert!((diff - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_compress_text_noop_under_threshold() {
        assert!(compress_text("short", 2_000).is_none());
    }

    #[test]
    fn test_compress_text_multibyte_safe() {
        let text = "日".repeat(3_000);
        let compressed = compress_text(&text, 2_000).unwrap();
        assert!(compressed.contains("[truncated]"));
        assert!(compressed.chars().count() < 3_000);
    }
}
