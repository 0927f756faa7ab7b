//! Configuration for scribe.

use crate::dedup::DedupConfig;
use crate::error::{Result, ScribeError};
use crate::merge::MergeConfig;
use crate::store::StoreConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ScribeConfig {
    pub merge: MergeConfig,
    pub dedup: DedupConfig,
    pub store: StoreConfig,
    pub session: SessionConfig,
    pub timers: TimerConfig,
}

/// Streaming session lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// A session auto-completes after this much inactivity.
    pub inactivity_timeout_ms: u64,
    /// A dangling non-streaming session older than this is discarded by GC.
    pub stale_session_ms: i64,
    /// Diagnostic snapshot history cap, oldest dropped first.
    pub snapshot_cap: usize,
    /// Diagnostic raw fragment log cap.
    pub raw_log_cap: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_ms: 3_000,
            stale_session_ms: 300_000,
            snapshot_cap: 50,
            raw_log_cap: 100,
        }
    }
}

/// Periodic maintenance timer configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimerConfig {
    /// Interval between GC sweeps.
    pub gc_interval_ms: u64,
    /// Interval between memory pressure samples.
    pub pressure_interval_ms: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            gc_interval_ms: 1_800_000,
            pressure_interval_ms: 300_000,
        }
    }
}

impl ScribeConfig {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file is missing or contains invalid TOML.
    /// Missing fields use default values.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ScribeError::ConfigFileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                ScribeError::Io(e)
            }
        })?;
        let config: ScribeConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if file doesn't exist
    ///
    /// Only falls back to defaults when the file is missing; invalid TOML is
    /// still an error.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(ScribeError::ConfigFileNotFound { .. }) => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - SCRIBE_MAX_RECORDS → store.max_records
    /// - SCRIBE_MAX_BYTES → store.max_bytes
    /// - SCRIBE_FUZZY_DEDUP → dedup.fuzzy ("1"/"true")
    /// - SCRIBE_INACTIVITY_TIMEOUT_MS → session.inactivity_timeout_ms
    /// - SCRIBE_GC_INTERVAL_MS → timers.gc_interval_ms
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("SCRIBE_MAX_RECORDS")
            && let Ok(n) = v.parse::<usize>()
            && n > 0
        {
            self.store.max_records = n;
        }
        if let Ok(v) = std::env::var("SCRIBE_MAX_BYTES")
            && let Ok(n) = v.parse::<usize>()
            && n > 0
        {
            self.store.max_bytes = n;
        }
        if let Ok(v) = std::env::var("SCRIBE_FUZZY_DEDUP") {
            self.dedup.fuzzy = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("SCRIBE_INACTIVITY_TIMEOUT_MS")
            && let Ok(n) = v.parse::<u64>()
            && n > 0
        {
            self.session.inactivity_timeout_ms = n;
        }
        if let Ok(v) = std::env::var("SCRIBE_GC_INTERVAL_MS")
            && let Ok(n) = v.parse::<u64>()
            && n > 0
        {
            self.timers.gc_interval_ms = n;
        }
        self
    }

    /// Rejects values the engine cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.store.max_records == 0 {
            return Err(ScribeError::ConfigInvalidValue {
                key: "store.max_records".to_string(),
                message: "must be positive".to_string(),
            });
        }
        if self.store.max_bytes == 0 {
            return Err(ScribeError::ConfigInvalidValue {
                key: "store.max_bytes".to_string(),
                message: "must be positive".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.dedup.similarity_threshold) {
            return Err(ScribeError::ConfigInvalidValue {
                key: "dedup.similarity_threshold".to_string(),
                message: "must be in [0.0, 1.0]".to_string(),
            });
        }
        for (key, ratio) in [
            ("store.evict_target_ratio", self.store.evict_target_ratio),
            ("store.pressure_target_ratio", self.store.pressure_target_ratio),
            ("store.critical_cap_ratio", self.store.critical_cap_ratio),
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(ScribeError::ConfigInvalidValue {
                    key: key.to_string(),
                    message: "must be in [0.0, 1.0]".to_string(),
                });
            }
        }
        Ok(())
    }
}
