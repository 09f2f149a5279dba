use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret '{key}' was not found")]
    NotFound { key: String },
    #[error("failed to read secrets file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse secrets file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Capability for resolving named secrets. Implementations must not log values.
pub trait SecretStore: Send + Sync {
    fn fetch(&self, key: &str) -> Result<String, SecretError>;
}

/// Binds a stored secret to the environment variable it is injected as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretBinding {
    pub key: String,
    pub inject_as: String,
}

/// Store with no secrets; every lookup fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSecrets;

impl SecretStore for NoSecrets {
    fn fetch(&self, key: &str) -> Result<String, SecretError> {
        Err(SecretError::NotFound {
            key: key.to_string(),
        })
    }
}

#[derive(Debug, Default, Clone)]
pub struct StaticSecretStore {
    values: BTreeMap<String, String>,
}

impl StaticSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

impl SecretStore for StaticSecretStore {
    fn fetch(&self, key: &str) -> Result<String, SecretError> {
        self.values
            .get(key)
            .cloned()
            .ok_or_else(|| SecretError::NotFound {
                key: key.to_string(),
            })
    }
}

/// Reads secrets from the runner's own environment.
///
/// `s3token` with prefix `STAGECRAFT_SECRET_` resolves `STAGECRAFT_SECRET_S3TOKEN`.
#[derive(Debug, Clone)]
pub struct EnvSecretStore {
    prefix: String,
}

impl EnvSecretStore {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn variable_for(&self, key: &str) -> String {
        let normalized: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{}", self.prefix, normalized)
    }
}

impl SecretStore for EnvSecretStore {
    fn fetch(&self, key: &str) -> Result<String, SecretError> {
        match std::env::var(self.variable_for(key)) {
            Ok(value) if !value.is_empty() => Ok(value),
            _ => Err(SecretError::NotFound {
                key: key.to_string(),
            }),
        }
    }
}

/// YAML mapping of secret key to value, loaded once.
#[derive(Debug, Clone)]
pub struct FileSecretStore {
    values: BTreeMap<String, String>,
}

impl FileSecretStore {
    pub fn load(path: &Path) -> Result<Self, SecretError> {
        let content = fs::read_to_string(path).map_err(|source| SecretError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let values: BTreeMap<String, String> =
            serde_yaml::from_str(&content).map_err(|err| SecretError::Parse {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?;
        Ok(Self { values })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl SecretStore for FileSecretStore {
    fn fetch(&self, key: &str) -> Result<String, SecretError> {
        self.values
            .get(key)
            .cloned()
            .ok_or_else(|| SecretError::NotFound {
                key: key.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn env_store_normalizes_keys() {
        let store = EnvSecretStore::new("STAGECRAFT_SECRET_");
        assert_eq!(store.variable_for("s3-token"), "STAGECRAFT_SECRET_S3_TOKEN");
    }

    #[test]
    fn file_store_loads_yaml_mapping() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("secrets.yaml");
        fs::write(&path, "s3token: sometoken\n").unwrap();

        let store = FileSecretStore::load(&path).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.fetch("s3token").unwrap(), "sometoken");
        assert!(matches!(
            store.fetch("other"),
            Err(SecretError::NotFound { key }) if key == "other"
        ));
    }

    #[test]
    fn file_store_rejects_malformed_yaml() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("secrets.yaml");
        fs::write(&path, "- just\n- a list\n").unwrap();
        assert!(matches!(
            FileSecretStore::load(&path),
            Err(SecretError::Parse { .. })
        ));
    }
}
