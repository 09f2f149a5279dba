use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use super::{ArtifactError, ArtifactRef, ArtifactStore, WriteReservations, validate_name};

/// Process-local store, used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
    reservations: WriteReservations,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn names(&self) -> Vec<String> {
        let blobs = self.blobs.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<_> = blobs.keys().cloned().collect();
        names.sort();
        names
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn exists(&self, name: &str) -> Result<bool, ArtifactError> {
        validate_name(name)?;
        let blobs = self.blobs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(blobs.contains_key(name))
    }

    fn read(&self, name: &str) -> Result<Vec<u8>, ArtifactError> {
        validate_name(name)?;
        let blobs = self.blobs.read().unwrap_or_else(PoisonError::into_inner);
        blobs
            .get(name)
            .cloned()
            .ok_or_else(|| ArtifactError::NotFound {
                name: name.to_string(),
            })
    }

    fn write(&self, name: &str, data: &[u8]) -> Result<(), ArtifactError> {
        validate_name(name)?;
        let _reservation = self.reservations.reserve(name)?;
        let mut blobs = self.blobs.write().unwrap_or_else(PoisonError::into_inner);
        blobs.insert(name.to_string(), data.to_vec());
        Ok(())
    }

    fn locate(&self, name: &str) -> Result<ArtifactRef, ArtifactError> {
        validate_name(name)?;
        Ok(ArtifactRef {
            name: name.to_string(),
            location_hint: format!("memory://{name}"),
        })
    }
}
