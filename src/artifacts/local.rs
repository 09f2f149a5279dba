use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::debug;

use super::{ArtifactError, ArtifactRef, ArtifactStore, WriteReservations, validate_name};

/// Artifacts stored as files below a root directory (usually the stage workdir).
#[derive(Debug)]
pub struct LocalArtifactStore {
    root: PathBuf,
    reservations: WriteReservations,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            reservations: WriteReservations::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, name: &str) -> Result<PathBuf, ArtifactError> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }
}

impl ArtifactStore for LocalArtifactStore {
    fn exists(&self, name: &str) -> Result<bool, ArtifactError> {
        let path = self.path_for(name)?;
        match fs::metadata(&path) {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(ArtifactError::Io {
                name: name.to_string(),
                path,
                source,
            }),
        }
    }

    fn read(&self, name: &str) -> Result<Vec<u8>, ArtifactError> {
        let path = self.path_for(name)?;
        match fs::read(&path) {
            Ok(data) => Ok(data),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(ArtifactError::NotFound {
                name: name.to_string(),
            }),
            Err(source) => Err(ArtifactError::Io {
                name: name.to_string(),
                path,
                source,
            }),
        }
    }

    fn write(&self, name: &str, data: &[u8]) -> Result<(), ArtifactError> {
        let path = self.path_for(name)?;
        let _reservation = self.reservations.reserve(name)?;
        let io_error = |source: std::io::Error, path: &Path| ArtifactError::Io {
            name: name.to_string(),
            path: path.to_path_buf(),
            source,
        };

        let parent = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(parent).map_err(|err| io_error(err, parent))?;

        // Stage into the destination directory so the final rename stays on one filesystem.
        let mut staged = NamedTempFile::new_in(parent).map_err(|err| io_error(err, parent))?;
        staged
            .write_all(data)
            .and_then(|_| staged.as_file().sync_all())
            .map_err(|err| io_error(err, staged.path()))?;
        staged
            .persist(&path)
            .map_err(|err| io_error(err.error, &path))?;

        debug!(artifact = name, bytes = data.len(), path = %path.display(), "Artifact written");
        Ok(())
    }

    fn locate(&self, name: &str) -> Result<ArtifactRef, ArtifactError> {
        let path = self.path_for(name)?;
        Ok(ArtifactRef {
            name: name.to_string(),
            location_hint: path.display().to_string(),
        })
    }
}
