//! Named byte blobs exchanged between stages.
//!
//! Stages only ever see artifact names; the store owns the physical blob.
//! Every backend validates names the same way and refuses a second writer
//! for a name while a write to it is still in progress.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use thiserror::Error;

pub mod local;
pub mod memory;
#[cfg(feature = "s3")]
pub mod object_store;

pub use local::LocalArtifactStore;
pub use memory::MemoryArtifactStore;
#[cfg(feature = "s3")]
pub use object_store::ObjectStoreArtifactStore;

const MAX_NAME_LENGTH: usize = 1024;
const MAX_SEGMENT_LENGTH: usize = 255;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact '{name}' not found")]
    NotFound { name: String },
    #[error("artifact '{name}' is already being written")]
    WriteConflict { name: String },
    #[error("invalid artifact name '{name}': {reason}")]
    InvalidName { name: String, reason: String },
    #[error("artifact '{name}' I/O error at {path}: {source}")]
    Io {
        name: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("artifact backend error: {0}")]
    Backend(String),
}

/// A named blob as seen by a stage, with a backend-specific location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactRef {
    pub name: String,
    pub location_hint: String,
}

pub trait ArtifactStore: Send + Sync {
    fn exists(&self, name: &str) -> Result<bool, ArtifactError>;

    /// Reads the full blob. A missing artifact is `NotFound`, never empty bytes.
    fn read(&self, name: &str) -> Result<Vec<u8>, ArtifactError>;

    /// Writes the full blob; readers observe either the old or the new content.
    fn write(&self, name: &str, data: &[u8]) -> Result<(), ArtifactError>;

    fn locate(&self, name: &str) -> Result<ArtifactRef, ArtifactError>;
}

pub fn validate_name(name: &str) -> Result<(), ArtifactError> {
    let invalid = |reason: &str| ArtifactError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    if name.is_empty() {
        return Err(invalid("name must not be empty"));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(invalid("name exceeds length limit"));
    }
    if name.contains('\\') {
        return Err(invalid("name must use '/' as separator"));
    }
    if name.starts_with('/') {
        return Err(invalid("name must be relative"));
    }
    for segment in name.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(invalid("name must not contain empty, '.' or '..' segments"));
        }
        if segment.len() > MAX_SEGMENT_LENGTH {
            return Err(invalid("segment exceeds length limit"));
        }
    }
    Ok(())
}

/// Names with a write in flight.
#[derive(Debug, Default)]
pub(crate) struct WriteReservations {
    active: Mutex<HashSet<String>>,
}

impl WriteReservations {
    pub(crate) fn reserve(&self, name: &str) -> Result<WriteReservation<'_>, ArtifactError> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(name.to_string()) {
            return Err(ArtifactError::WriteConflict {
                name: name.to_string(),
            });
        }
        Ok(WriteReservation {
            owner: self,
            name: name.to_string(),
        })
    }
}

pub(crate) struct WriteReservation<'a> {
    owner: &'a WriteReservations,
    name: String,
}

impl Drop for WriteReservation<'_> {
    fn drop(&mut self) {
        self.owner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.name);
    }
}
