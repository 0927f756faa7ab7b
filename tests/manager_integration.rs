//! End-to-end scenarios for the transcript engine: lifecycle, eviction,
//! persistence and timer behavior through the public API only.

use scribe::{
    BlobStore, EventKind, ManualClock, ManualScheduler, MemoryBlobStore, MemoryPressure,
    ScribeConfig, TranscriptFragment, TranscriptManager, TranscriptRecord, TranscriptSource,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Harness {
    manager: TranscriptManager,
    clock: Arc<ManualClock>,
    scheduler: Arc<Mutex<ManualScheduler>>,
}

impl Harness {
    fn new(config: ScribeConfig) -> Self {
        Self::with_blob_store(config, None)
    }

    fn with_blob_store(config: ScribeConfig, blob_store: Option<MemoryBlobStore>) -> Self {
        let clock = ManualClock::new(1_000_000);
        let scheduler = Arc::new(Mutex::new(ManualScheduler::new()));
        let mut manager = TranscriptManager::new(config, Box::new(Arc::clone(&scheduler)))
            .with_clock(clock.clone());
        if let Some(blob_store) = blob_store {
            manager = manager.with_blob_store(Box::new(blob_store));
        }
        manager.init();
        Self {
            manager,
            clock,
            scheduler,
        }
    }

    fn advance(&mut self, ms: u64) {
        self.clock.advance(ms as i64);
        let events = self
            .scheduler
            .lock()
            .unwrap()
            .advance(Duration::from_millis(ms));
        for event in events {
            self.manager.handle_timer(event);
        }
    }
}

fn fragment(text: &str) -> TranscriptFragment {
    TranscriptFragment::partial(text, 0)
}

#[test]
fn completion_ordering_scenario() {
    let mut h = Harness::new(ScribeConfig::default());

    let completed = Arc::new(Mutex::new(Vec::new()));
    let completed_clone = Arc::clone(&completed);
    h.manager
        .subscribe(move |event, state| {
            if event == EventKind::StreamingCompleted {
                let texts: Vec<String> = state.transcripts.iter().map(|r| r.text.clone()).collect();
                completed_clone.lock().unwrap().push(texts);
            }
        })
        .detach();

    h.manager.start_streaming(fragment("a"));
    h.manager.update_streaming("a b", true);
    h.manager.update_streaming("a b c", false);

    // Exactly one record, exactly one completion, record visible by then.
    let state = h.manager.state();
    assert_eq!(state.transcripts.len(), 1);
    assert_eq!(state.transcripts[0].text, "a b c");

    let completed = completed.lock().unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0], vec!["a b c".to_string()]);
}

#[test]
fn single_active_session_policy() {
    let mut h = Harness::new(ScribeConfig::default());

    h.manager.start_streaming(fragment("first utterance here"));
    h.manager.update_streaming("first utterance here now", true);
    // Second start while the first is active: the first is finalized.
    h.manager.start_streaming(fragment("second thing"));
    h.manager.complete_streaming();

    let state = h.manager.state();
    assert_eq!(state.transcripts.len(), 2);
    assert_eq!(state.transcripts[0].text, "first utterance here now");
    assert_eq!(state.transcripts[1].text, "second thing");
}

#[test]
fn growing_prefix_stream_accumulates_without_duplication() {
    let mut h = Harness::new(ScribeConfig::default());

    h.manager.start_streaming(fragment("the"));
    h.manager.update_streaming("the quick", true);
    h.manager.update_streaming("the quick brown", true);
    // Model restarts on a new segment.
    h.manager.update_streaming("fox jumps", true);
    h.manager.complete_streaming();

    let state = h.manager.state();
    assert_eq!(state.transcripts.len(), 1);
    assert_eq!(state.transcripts[0].text, "the quick brown fox jumps");
}

#[test]
fn inactivity_timeout_finalizes_after_true_gap() {
    let mut h = Harness::new(ScribeConfig::default());

    h.manager.start_streaming(fragment("hello"));
    h.advance(2_000);
    h.manager.update_streaming("hello world", true);
    h.advance(2_000);
    // 4s since start but only 2s since last activity: still alive.
    assert!(h.manager.is_streaming());

    h.advance(1_000);
    assert!(!h.manager.is_streaming());
    assert_eq!(h.manager.state().transcripts[0].text, "hello world");
}

#[test]
fn gc_sweep_keeps_store_within_bounds() {
    let mut config = ScribeConfig::default();
    config.store.max_records = 20;
    // Keep the pressure sampler out of the way; this exercises the sweep.
    config.timers.pressure_interval_ms = 86_400_000;
    let mut h = Harness::new(config);

    for i in 0..60 {
        let mut frag = fragment(&format!("utterance number {i} with some words"));
        frag.timestamp = 1_000_000 + i;
        frag.confidence = Some(0.5);
        h.manager.add_transcript(frag);
    }
    assert!(h.manager.state().transcripts.len() > 20);

    // Default GC interval is 30 minutes.
    h.advance(30 * 60 * 1_000);

    let stats = h.manager.memory_stats();
    assert!(stats.record_count <= 20);
    assert!(stats.estimated_bytes <= stats.max_bytes);
}

#[test]
fn priority_eviction_prefers_strong_records() {
    let mut config = ScribeConfig::default();
    config.store.max_records = 40;
    config.timers.pressure_interval_ms = 86_400_000;
    let mut h = Harness::new(config);

    // Older but long, high-confidence records...
    for i in 0..30 {
        let mut frag = fragment(&format!(
            "keeper {i} with a good long body of transcribed text {}",
            "word ".repeat(30)
        ));
        frag.timestamp = 400_000 + i;
        frag.confidence = Some(0.95);
        frag.id = Some(format!("keeper-{i}"));
        h.manager.add_transcript(frag);
    }
    // ...then newer, short, low-confidence noise pushing past the cap.
    for i in 0..30 {
        let mut frag = fragment(&format!("uh {i}"));
        frag.timestamp = 1_000_000 + i;
        frag.confidence = Some(0.05);
        frag.id = Some(format!("noise-{i}"));
        h.manager.add_transcript(frag);
    }

    h.advance(30 * 60 * 1_000);

    let state = h.manager.state();
    let keepers = state
        .transcripts
        .iter()
        .filter(|r| r.id.starts_with("keeper-"))
        .count();
    let noise = state
        .transcripts
        .iter()
        .filter(|r| r.id.starts_with("noise-"))
        .count();
    // Not FIFO: every old-but-strong record survives, the recent noise goes.
    assert_eq!(keepers, 30);
    assert!(noise < 30);
}

#[test]
fn persisted_history_restores_on_init() -> anyhow::Result<()> {
    let record = TranscriptRecord::new(
        None,
        "persisted text".to_string(),
        900_000,
        Some(0.8),
        TranscriptSource::Microphone,
    );
    let bytes = scribe::persist::encode(&[record], 900_000)?;
    let mut blob = MemoryBlobStore::new();
    blob.save(&bytes)?;

    let h = Harness::with_blob_store(ScribeConfig::default(), Some(blob));
    let state = h.manager.state();
    assert_eq!(state.transcripts.len(), 1);
    assert_eq!(state.transcripts[0].text, "persisted text");
    Ok(())
}

#[test]
fn corrupt_blob_degrades_to_empty_store() -> anyhow::Result<()> {
    let mut blob = MemoryBlobStore::new();
    blob.save(b"{not valid json at all")?;

    let mut h = Harness::with_blob_store(ScribeConfig::default(), Some(blob));
    assert!(h.manager.state().transcripts.is_empty());

    // The engine still works normally afterwards.
    h.manager.start_streaming(fragment("fresh start"));
    h.manager.complete_streaming();
    assert_eq!(h.manager.state().transcripts.len(), 1);
    Ok(())
}

#[test]
fn capacity_error_triggers_trim_and_retry() {
    // Small enough that a full history overflows, large enough that the
    // newest-20% retry fits.
    let blob = MemoryBlobStore::with_capacity_limit(2_000);
    let mut h = Harness::with_blob_store(ScribeConfig::default(), Some(blob));

    for i in 0..20 {
        let mut frag = fragment(&format!("entry {i}: {}", "text ".repeat(20)));
        frag.timestamp = 1_000_000 + i;
        h.manager.add_transcript(frag);
    }

    // The engine trimmed itself down to keep persistence alive; nothing
    // panicked and the newest entries are the ones retained.
    let state = h.manager.state();
    assert!(!state.transcripts.is_empty());
    assert!(state.transcripts.len() < 20);
    let last = state.transcripts.last().unwrap();
    assert!(last.text.starts_with("entry 19"));
}

#[test]
fn fuzzy_dedup_collapses_near_identical_records() {
    let mut config = ScribeConfig::default();
    config.dedup.fuzzy = true;
    let mut h = Harness::new(config);

    let mut a = fragment("the quick brown fox jumps over the lazy dog");
    a.timestamp = 1_000_000;
    a.confidence = Some(0.6);
    a.id = Some("a".to_string());
    h.manager.add_transcript(a);

    let mut b = fragment("the quick brown fox jumps over the lazy dog");
    b.timestamp = 1_002_000; // inside the 5s window
    b.confidence = Some(0.9);
    b.id = Some("b".to_string());
    h.manager.add_transcript(b);

    let state = h.manager.state();
    assert_eq!(state.transcripts.len(), 1);
    // Higher-confidence duplicate replaced the original in place.
    assert_eq!(state.transcripts[0].id, "b");
}

#[test]
fn critical_pressure_sample_forces_aggressive_sweep() {
    let mut config = ScribeConfig::default();
    config.store.max_records = 20;
    let mut h = Harness::new(config);

    for i in 0..60 {
        let mut frag = fragment(&format!("overflow entry {i} with words"));
        frag.timestamp = 1_000_000 + i;
        h.manager.add_transcript(frag);
    }
    assert_eq!(h.manager.memory_stats().pressure, MemoryPressure::Critical);

    // Default sampling interval is five minutes. The sample tightens the
    // cap, sweeps aggressively and restores the cap afterwards.
    h.advance(5 * 60 * 1_000);

    let stats = h.manager.memory_stats();
    assert!(stats.record_count <= 6);
    assert_eq!(stats.effective_max_records, stats.max_records);
}

#[test]
fn memory_stats_expose_pressure_tier() {
    let mut config = ScribeConfig::default();
    config.store.max_records = 10;
    let mut h = Harness::new(config);

    assert_eq!(h.manager.memory_stats().pressure, MemoryPressure::Low);
    for i in 0..8 {
        let mut frag = fragment(&format!("filler number {i}"));
        frag.timestamp = 1_000_000 + i;
        h.manager.add_transcript(frag);
    }
    assert_eq!(h.manager.memory_stats().pressure, MemoryPressure::High);
    assert!(h.manager.memory_usage() > 0);
}

#[test]
fn clear_transcripts_emits_and_empties() {
    let mut h = Harness::new(ScribeConfig::default());
    let cleared = Arc::new(Mutex::new(false));
    let cleared_clone = Arc::clone(&cleared);
    h.manager
        .subscribe(move |event, state| {
            if event == EventKind::TranscriptsCleared {
                assert!(state.transcripts.is_empty());
                *cleared_clone.lock().unwrap() = true;
            }
        })
        .detach();

    h.manager.start_streaming(fragment("something"));
    h.manager.complete_streaming();
    h.manager.clear_transcripts();

    assert!(*cleared.lock().unwrap());
    assert!(h.manager.state().transcripts.is_empty());
}

#[tokio::test(start_paused = true)]
async fn tokio_scheduler_drives_inactivity_timeout() {
    use scribe::TokioScheduler;

    let (scheduler, mut rx) = TokioScheduler::new();
    let mut manager = TranscriptManager::new(ScribeConfig::default(), Box::new(scheduler));
    manager.init();

    manager.start_streaming(fragment("hello from tokio"));
    assert!(manager.is_streaming());

    tokio::time::advance(Duration::from_millis(3_100)).await;
    // The inactivity timer fired; drive it back into the engine.
    let event = rx.recv().await.unwrap();
    manager.handle_timer(event);

    assert!(!manager.is_streaming());
    assert_eq!(manager.state().transcripts[0].text, "hello from tokio");
}
