//! Best-effort persistence of the transcript history.
//!
//! The storage medium is an injected key-value blob collaborator; the engine
//! never fails startup over a missing or corrupt blob and never propagates a
//! write failure to callers.

use crate::error::{Result, ScribeError};
use crate::fragment::TranscriptRecord;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

/// Opaque single-blob storage.
///
/// `load` returning `Ok(None)` means "nothing persisted yet". A `save`
/// failing with [`ScribeError::PersistCapacity`] signals the medium is full
/// and triggers the trim-and-retry fallback.
pub trait BlobStore: Send {
    fn load(&mut self) -> Result<Option<Vec<u8>>>;
    fn save(&mut self, bytes: &[u8]) -> Result<()>;
}

/// JSON layout of the persisted blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub transcripts: Vec<TranscriptRecord>,
    pub metadata: PersistedMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedMetadata {
    #[serde(rename = "lastSaved")]
    pub last_saved: i64,
    pub version: String,
}

/// Serializes the history into the blob layout.
pub fn encode(transcripts: &[TranscriptRecord], now_ms: i64) -> Result<Vec<u8>> {
    let state = PersistedState {
        transcripts: transcripts.to_vec(),
        metadata: PersistedMetadata {
            last_saved: now_ms,
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    };
    Ok(serde_json::to_vec(&state)?)
}

/// Parses a persisted blob; corruption surfaces as `PersistCorrupt`.
pub fn decode(bytes: &[u8]) -> Result<PersistedState> {
    Ok(serde_json::from_slice(bytes)?)
}

/// In-memory blob store with an optional capacity, for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blob: Option<Vec<u8>>,
    capacity: Option<usize>,
    saves: usize,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps the accepted blob size; larger saves fail with
    /// `PersistCapacity`.
    pub fn with_capacity_limit(capacity: usize) -> Self {
        Self {
            blob: None,
            capacity: Some(capacity),
            saves: 0,
        }
    }

    pub fn blob(&self) -> Option<&[u8]> {
        self.blob.as_deref()
    }

    pub fn save_count(&self) -> usize {
        self.saves
    }
}

impl BlobStore for MemoryBlobStore {
    fn load(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.blob.clone())
    }

    fn save(&mut self, bytes: &[u8]) -> Result<()> {
        self.saves += 1;
        if let Some(cap) = self.capacity
            && bytes.len() > cap
        {
            return Err(ScribeError::PersistCapacity);
        }
        self.blob = Some(bytes.to_vec());
        Ok(())
    }
}

/// Blob store backed by a single file. Writes go through a temporary file
/// and a rename so a crash mid-write cannot corrupt the previous blob.
#[derive(Debug)]
pub struct FileBlobStore {
    path: PathBuf,
}

impl FileBlobStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl BlobStore for FileBlobStore {
    fn load(&mut self) -> Result<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&mut self, bytes: &[u8]) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        let write_result = fs::write(&tmp, bytes).and_then(|()| fs::rename(&tmp, &self.path));
        write_result.map_err(|e| match e.kind() {
            ErrorKind::StorageFull | ErrorKind::QuotaExceeded => ScribeError::PersistCapacity,
            _ => e.into(),
        })
    }
}
