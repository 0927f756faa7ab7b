//! Fragment merge engine.
//!
//! Combines a new partial fragment with the accumulated text of the active
//! session. Naive replace-on-every-partial loses earlier speech whenever the
//! upstream model truncates or restarts mid-utterance, so merging is layered:
//! a cheap growing-prefix fast path, a word-overlap heuristic to recover from
//! model restarts, and a classic suffix-prefix overlap append for everything
//! else.
//!
//! Pure functions, no I/O; degenerate inputs are no-ops.

use serde::{Deserialize, Serialize};

/// Tunables for the merge engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MergeConfig {
    /// Reject a fragment that drastically shrinks the last partial while
    /// already being contained in the accumulated text. Off by default:
    /// over-eager rejection has dropped legitimate content in practice.
    pub regression_guard: bool,
    /// A fragment shorter than this fraction of the last partial counts as a
    /// drastic shrink (0.4 means a >60% shrink).
    pub regression_shrink_ratio: f64,
    /// How many trailing words are checked when deciding whether two
    /// fragments share any overlap (model-restart detection).
    pub overlap_window_words: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            regression_guard: false,
            regression_shrink_ratio: 0.4,
            overlap_window_words: 4,
        }
    }
}

/// Merges `new_fragment` into `accumulated` with default tunables.
pub fn merge(accumulated: &str, last_partial: &str, new_fragment: &str) -> String {
    merge_with(&MergeConfig::default(), accumulated, last_partial, new_fragment)
}

/// Merges `new_fragment` into `accumulated`, given the previous partial text.
///
/// Rules, first match wins:
/// 1. empty fragment → `accumulated` unchanged
/// 2. empty accumulated → fragment
/// 3. fragment extends the last partial → replace the trailing partial
/// 4. no word overlap with the last partial → model restart, append both
/// 5. otherwise → longest suffix-prefix overlap append
///
/// Deterministic and panic-free for any input.
pub fn merge_with(
    config: &MergeConfig,
    accumulated: &str,
    last_partial: &str,
    new_fragment: &str,
) -> String {
    let frag = new_fragment.trim();
    if frag.is_empty() {
        return accumulated.to_string();
    }

    let acc = accumulated.trim();
    if acc.is_empty() {
        return collapse_whitespace(frag);
    }

    let last = last_partial.trim();

    if config.regression_guard
        && !last.is_empty()
        && (frag.len() as f64) < last.len() as f64 * config.regression_shrink_ratio
        && acc.contains(frag)
    {
        // Spurious truncation from the model; the content is already there.
        return accumulated.to_string();
    }

    if !last.is_empty() {
        // Growing prefix: the common case with an incrementally refining
        // model ("hello", "hello wor", "hello world").
        if frag.starts_with(last) && frag.len() >= last.len() {
            if let Some(head) = acc.strip_suffix(last) {
                let mut merged = String::with_capacity(head.len() + frag.len());
                merged.push_str(head);
                merged.push_str(frag);
                return collapse_whitespace(&merged);
            }
            // Accumulated drifted away from the partial; keep the longer view.
            return if frag.len() > acc.len() {
                collapse_whitespace(frag)
            } else {
                collapse_whitespace(acc)
            };
        }

        // Model restart: the new fragment shares no trailing words with the
        // previous partial, so it is a fresh utterance segment. Keep the old
        // partial, then append the new fragment.
        if !words_overlap(last, frag, config.overlap_window_words) {
            let mut merged = String::with_capacity(acc.len() + last.len() + frag.len() + 2);
            merged.push_str(acc);
            if !acc.ends_with(last) {
                merged.push(' ');
                merged.push_str(last);
            }
            if !merged.contains(frag) {
                merged.push(' ');
                merged.push_str(frag);
            }
            return collapse_whitespace(&merged);
        }
    }

    // Genuine overlap: append only the part of the fragment that extends the
    // accumulated text.
    let overlap = suffix_prefix_overlap(acc, frag);
    let mut merged = String::with_capacity(acc.len() + frag.len() + 1);
    merged.push_str(acc);
    if overlap == 0 {
        merged.push(' ');
        merged.push_str(frag);
    } else {
        merged.push_str(&frag[overlap..]);
    }
    collapse_whitespace(&merged)
}

/// Length in bytes of the longest suffix of `acc` that is a prefix of
/// `frag`, scanned from the longest candidate down.
fn suffix_prefix_overlap(acc: &str, frag: &str) -> usize {
    let max = acc.len().min(frag.len());
    for len in (1..=max).rev() {
        if frag.is_char_boundary(len) && acc.ends_with(&frag[..len]) {
            return len;
        }
    }
    0
}

/// Whether the last `window` words of either string appear in the other
/// (case-insensitive). No shared words means a model restart.
fn words_overlap(a: &str, b: &str, window: usize) -> bool {
    tail_words_appear_in(a, b, window) || tail_words_appear_in(b, a, window)
}

fn tail_words_appear_in(source: &str, target: &str, window: usize) -> bool {
    let tail: Vec<String> = source
        .split_whitespace()
        .rev()
        .take(window)
        .map(str::to_lowercase)
        .collect();
    if tail.is_empty() {
        return false;
    }
    let target_words: Vec<String> = target.split_whitespace().map(str::to_lowercase).collect();
    tail.iter().any(|w| target_words.iter().any(|t| t == w))
}

/// Collapses runs of whitespace to single spaces and trims.
fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
