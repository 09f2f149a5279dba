use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::artifacts::{ArtifactStore, LocalArtifactStore, MemoryArtifactStore};
use crate::secrets::{EnvSecretStore, FileSecretStore, NoSecrets, SecretStore};

pub const DEFAULT_SECRET_PREFIX: &str = "STAGECRAFT_SECRET_";

/// The `runtime` section of a pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Upper bound on stages running at the same time.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Working directory for stage processes. Defaults to the definition's directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<PathBuf>,
    /// Ambient variables copied from the runner into every stage environment.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inherit_env: Vec<String>,
    /// Stop dispatching new stages after the first failure.
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default)]
    pub artifacts: ArtifactBackendConfig,
    #[serde(default)]
    pub secrets: SecretBackendConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            workdir: None,
            inherit_env: Vec::new(),
            fail_fast: false,
            artifacts: ArtifactBackendConfig::default(),
            secrets: SecretBackendConfig::default(),
        }
    }
}

fn default_workers() -> usize {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "kebab-case")]
pub enum ArtifactBackendConfig {
    /// Files below `root`, or below the workdir when unset.
    Local {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        root: Option<PathBuf>,
    },
    Memory,
    S3(S3Config),
}

impl Default for ArtifactBackendConfig {
    fn default() -> Self {
        ArtifactBackendConfig::Local { root: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub force_path_style: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "kebab-case")]
pub enum SecretBackendConfig {
    #[default]
    None,
    Env {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefix: Option<String>,
    },
    File {
        path: PathBuf,
    },
}

impl RuntimeConfig {
    pub fn resolve_workdir(&self, base_dir: &Path) -> PathBuf {
        match &self.workdir {
            Some(dir) => resolve_path(base_dir, dir),
            None => base_dir.to_path_buf(),
        }
    }

    pub fn build_artifact_store(&self, base_dir: &Path) -> Result<Arc<dyn ArtifactStore>> {
        match &self.artifacts {
            ArtifactBackendConfig::Local { root } => {
                let root = match root {
                    Some(root) => resolve_path(base_dir, root),
                    None => self.resolve_workdir(base_dir),
                };
                Ok(Arc::new(LocalArtifactStore::new(root)))
            }
            ArtifactBackendConfig::Memory => Ok(Arc::new(MemoryArtifactStore::new())),
            #[cfg(feature = "s3")]
            ArtifactBackendConfig::S3(config) => {
                let store = crate::artifacts::ObjectStoreArtifactStore::connect(config)
                    .with_context(|| format!("Failed to connect to bucket '{}'", config.bucket))?;
                Ok(Arc::new(store))
            }
            #[cfg(not(feature = "s3"))]
            ArtifactBackendConfig::S3(config) => anyhow::bail!(
                "Artifact backend 's3' (bucket '{}') requires stagecraft to be built with --features s3",
                config.bucket
            ),
        }
    }

    pub fn build_secret_store(&self, base_dir: &Path) -> Result<Arc<dyn SecretStore>> {
        match &self.secrets {
            SecretBackendConfig::None => Ok(Arc::new(NoSecrets)),
            SecretBackendConfig::Env { prefix } => Ok(Arc::new(EnvSecretStore::new(
                prefix.as_deref().unwrap_or(DEFAULT_SECRET_PREFIX),
            ))),
            SecretBackendConfig::File { path } => {
                let path = resolve_path(base_dir, path);
                let store = FileSecretStore::load(&path)
                    .with_context(|| format!("Failed to load secrets file: {}", path.display()))?;
                Ok(Arc::new(store))
            }
        }
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.workers == 0 {
            errors.push("runtime.workers must be at least 1".to_string());
        }
        for key in &self.inherit_env {
            if key.trim().is_empty() || key.contains('=') {
                errors.push(format!("runtime.inherit_env entry '{key}' is not a variable name"));
            }
        }
        if let ArtifactBackendConfig::S3(config) = &self.artifacts
            && config.bucket.trim().is_empty()
        {
            errors.push("runtime.artifacts.bucket must not be empty".to_string());
        }
        errors
    }
}

fn resolve_path(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_empty_section() {
        let config: RuntimeConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.workers, 2);
        assert!(!config.fail_fast);
        assert!(matches!(
            config.artifacts,
            ArtifactBackendConfig::Local { root: None }
        ));
        assert!(matches!(config.secrets, SecretBackendConfig::None));
        assert!(config.validate().is_empty());
    }

    #[test]
    fn tagged_backends_parse() {
        let yaml = r#"
workers: 4
artifacts:
  backend: s3
  bucket: mybucket
  prefix: runs
secrets:
  backend: env
  prefix: CI_SECRET_
"#;
        let config: RuntimeConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.workers, 4);
        match &config.artifacts {
            ArtifactBackendConfig::S3(s3) => {
                assert_eq!(s3.bucket, "mybucket");
                assert_eq!(s3.prefix.as_deref(), Some("runs"));
            }
            other => panic!("unexpected backend: {other:?}"),
        }
        assert!(matches!(
            &config.secrets,
            SecretBackendConfig::Env { prefix: Some(p) } if p == "CI_SECRET_"
        ));
    }

    #[test]
    fn workdir_resolves_against_definition_directory() {
        let config = RuntimeConfig {
            workdir: Some(PathBuf::from("work")),
            ..RuntimeConfig::default()
        };
        assert_eq!(
            config.resolve_workdir(Path::new("/pipelines")),
            PathBuf::from("/pipelines/work")
        );
    }

    #[test]
    fn zero_workers_is_rejected() {
        let config = RuntimeConfig {
            workers: 0,
            ..RuntimeConfig::default()
        };
        assert_eq!(config.validate().len(), 1);
    }
}
