//! Data types for incoming fragments and finalized transcript records.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Where a fragment originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptSource {
    /// Local microphone capture.
    Microphone,
    /// System / loopback audio.
    System,
    /// Mixed capture (microphone + system).
    Mixed,
    /// Source not reported by the transport.
    #[default]
    Unknown,
}

impl TranscriptSource {
    /// Stable lowercase name, used in deterministic id hashing.
    pub fn as_str(&self) -> &'static str {
        match self {
            TranscriptSource::Microphone => "microphone",
            TranscriptSource::System => "system",
            TranscriptSource::Mixed => "mixed",
            TranscriptSource::Unknown => "unknown",
        }
    }
}

impl fmt::Display for TranscriptSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One incoming piece of text from the transcription source.
///
/// Ephemeral: the core borrows it for the duration of one call and copies
/// what it keeps.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptFragment {
    /// Upstream-assigned id, if any.
    pub id: Option<String>,
    /// Fragment text, possibly still subject to revision.
    pub text: String,
    /// True while the upstream model may still revise this fragment.
    pub is_partial: bool,
    /// Epoch milliseconds; zero or negative means "not reported".
    pub timestamp: i64,
    /// Model confidence in [0.0, 1.0], if reported.
    pub confidence: Option<f32>,
    /// Capture source.
    pub source: TranscriptSource,
}

impl TranscriptFragment {
    /// Creates a partial fragment with only text and timestamp set.
    pub fn partial(text: impl Into<String>, timestamp: i64) -> Self {
        Self {
            id: None,
            text: text.into(),
            is_partial: true,
            timestamp,
            confidence: None,
            source: TranscriptSource::Unknown,
        }
    }

    /// Basic shape validation: malformed fragments are dropped, never
    /// propagated as errors.
    ///
    /// Returns the sanitized fragment, or `None` if there is nothing usable.
    /// A missing timestamp is replaced with `now_ms`; confidence is clamped
    /// to [0.0, 1.0].
    pub fn sanitized(mut self, now_ms: i64) -> Option<Self> {
        let trimmed = self.text.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.len() != self.text.len() {
            self.text = trimmed.to_string();
        }
        if self.timestamp <= 0 {
            self.timestamp = now_ms;
        }
        if let Some(c) = self.confidence {
            if !c.is_finite() {
                self.confidence = None;
            } else {
                self.confidence = Some(c.clamp(0.0, 1.0));
            }
        }
        if let Some(id) = &self.id
            && id.trim().is_empty()
        {
            self.id = None;
        }
        Some(self)
    }
}

/// A finalized, persisted transcript entry.
///
/// Immutable once inserted, except for in-place compression of over-long
/// text during GC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptRecord {
    /// Deterministic hash of (text, timestamp, source, confidence) when the
    /// upstream did not supply an id, so a replayed utterance maps to the
    /// same id.
    pub id: String,
    pub text: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub source: TranscriptSource,
    /// Extra payload (audio reference, speaker labels, ...). Records carrying
    /// it score a completeness bonus during eviction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl TranscriptRecord {
    /// Builds a record, deriving the id when none is supplied.
    pub fn new(
        id: Option<String>,
        text: String,
        timestamp: i64,
        confidence: Option<f32>,
        source: TranscriptSource,
    ) -> Self {
        let id = match id {
            Some(id) if !id.trim().is_empty() => id,
            _ => derive_record_id(&text, timestamp, source, confidence),
        };
        Self {
            id,
            text,
            timestamp,
            confidence,
            source,
            metadata: None,
        }
    }

    /// Attaches extra metadata (builder style).
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Estimated in-memory footprint: two bytes per text byte plus a fixed
    /// per-record overhead.
    pub fn estimated_bytes(&self) -> usize {
        self.text.len() * 2 + RECORD_OVERHEAD_BYTES
    }
}

/// Fixed per-record bookkeeping overhead used by the memory estimate.
pub const RECORD_OVERHEAD_BYTES: usize = 200;

/// Deterministic record id: truncated SHA-256 over the identifying fields.
pub fn derive_record_id(
    text: &str,
    timestamp: i64,
    source: TranscriptSource,
    confidence: Option<f32>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hasher.update(b"|");
    hasher.update(timestamp.to_le_bytes());
    hasher.update(b"|");
    hasher.update(source.as_str().as_bytes());
    hasher.update(b"|");
    match confidence {
        Some(c) => hasher.update(format!("{c:.4}").as_bytes()),
        None => hasher.update(b"none"),
    }
    let digest = hasher.finalize();
    let mut id = String::with_capacity(19);
    id.push_str("tr-");
    for byte in digest.iter().take(8) {
        use std::fmt::Write;
        // write! to a String cannot fail
        write!(id, "{byte:02x}").ok();
    }
    id
}
