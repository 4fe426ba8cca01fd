//! Durable cache of the last authoritative trips collection.
//!
//! The snapshot is written as a checksummed envelope and replaced atomically
//! (write to a temp file, fsync, rename). Reading never fails past this
//! module: a missing or damaged snapshot reads as "no snapshot".

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::Trip;

const CURRENT_SCHEMA_VERSION: u32 = 1;
const MAX_STORE_BYTES: usize = 50 * 1024 * 1024;
const MAX_CACHED_TRIPS: usize = 10_000;
const STORE_MAGIC: &[u8; 4] = b"TRPC";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("trip snapshot encoding failed: {0}")]
    Serialization(String),

    #[error("trip snapshot io: {0}")]
    Io(#[from] std::io::Error),

    #[error("trip snapshot corrupted: {reason}")]
    Corrupted { reason: &'static str },

    #[error("trip snapshot checksum mismatch (stored {expected}, computed {actual})")]
    IntegrityCheckFailed { expected: String, actual: String },

    #[error("trip snapshot written by schema {found}, this build reads up to {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("trip snapshot is {size} bytes, limit is {max}")]
    StoreTooLarge { size: usize, max: usize },

    #[error("too many trips: {count}, max {max}")]
    TooManyTrips { count: usize, max: usize },
}

impl From<ciborium::de::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct StoreEnvelope {
    magic: [u8; 4],
    schema_version: u32,
    checksum: [u8; 32],
    /// JSON of the collection exactly as the server sent it.
    payload: Vec<u8>,
}

/// File-backed snapshot of the trips collection.
#[derive(Debug, Clone)]
pub struct CacheStore {
    path: PathBuf,
}

impl CacheStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the stored snapshot with `trips`.
    pub fn save(&self, trips: &[Trip]) -> Result<(), StoreError> {
        if trips.len() > MAX_CACHED_TRIPS {
            return Err(StoreError::TooManyTrips {
                count: trips.len(),
                max: MAX_CACHED_TRIPS,
            });
        }

        let bytes = Self::serialize(trips)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let tmp_path = self.path.with_extension("tmp");

        let mut file = File::create(&tmp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;

        std::fs::rename(&tmp_path, &self.path)?;

        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        debug!(trips = trips.len(), bytes = bytes.len(), "Trips snapshot saved");
        Ok(())
    }

    /// Last saved snapshot, or `None` on first run or when the file is damaged.
    pub fn load(&self) -> Option<Vec<Trip>> {
        match self.try_load() {
            Ok(trips) => trips,
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Trips snapshot unreadable, serving empty cache"
                );
                None
            }
        }
    }

    /// Like [`CacheStore::load`] but reports why a snapshot could not be read.
    pub fn try_load(&self) -> Result<Option<Vec<Trip>>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }

        let bytes = std::fs::read(&self.path)?;

        if bytes.is_empty() {
            return Err(StoreError::Corrupted {
                reason: "empty file",
            });
        }

        Self::deserialize(&bytes).map(Some)
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn serialize(trips: &[Trip]) -> Result<Vec<u8>, StoreError> {
        let payload =
            serde_json::to_vec(trips).map_err(|e| StoreError::Serialization(e.to_string()))?;

        let checksum = blake3::hash(&payload);

        let envelope = StoreEnvelope {
            magic: *STORE_MAGIC,
            schema_version: CURRENT_SCHEMA_VERSION,
            checksum: *checksum.as_bytes(),
            payload,
        };

        let mut envelope_bytes = Vec::new();
        ciborium::into_writer(&envelope, &mut envelope_bytes)?;

        Ok(envelope_bytes)
    }

    fn deserialize(bytes: &[u8]) -> Result<Vec<Trip>, StoreError> {
        if bytes.len() > MAX_STORE_BYTES {
            return Err(StoreError::StoreTooLarge {
                size: bytes.len(),
                max: MAX_STORE_BYTES,
            });
        }

        let envelope: StoreEnvelope = ciborium::from_reader(bytes)?;

        if envelope.magic != *STORE_MAGIC {
            return Err(StoreError::Corrupted {
                reason: "invalid magic bytes",
            });
        }

        if envelope.schema_version > CURRENT_SCHEMA_VERSION {
            return Err(StoreError::FutureSchema {
                found: envelope.schema_version,
                max: CURRENT_SCHEMA_VERSION,
            });
        }

        let actual_checksum = blake3::hash(&envelope.payload);
        if actual_checksum.as_bytes() != &envelope.checksum {
            return Err(StoreError::IntegrityCheckFailed {
                expected: hex::encode(envelope.checksum),
                actual: hex::encode(actual_checksum.as_bytes()),
            });
        }

        let trips: Vec<Trip> = serde_json::from_slice(&envelope.payload)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        if trips.len() > MAX_CACHED_TRIPS {
            return Err(StoreError::TooManyTrips {
                count: trips.len(),
                max: MAX_CACHED_TRIPS,
            });
        }

        Ok(trips)
    }
}
