use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::RuntimeConfig;
use crate::contract::{ContractEntrySpec, Environment};
use crate::secrets::SecretBinding;
use crate::stage::CommandSpec;

pub const CURRENT_VERSION: u32 = 1;

/// Parsed pipeline definition file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Variables given to every stage.
    #[serde(default, skip_serializing_if = "Environment::is_empty")]
    pub env: Environment,
    pub pipeline: Vec<StageSpec>,
}

/// A stage as written in the definition, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    pub command: CommandSpec,
    #[serde(default, skip_serializing_if = "Environment::is_empty")]
    pub env: Environment,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<SecretBinding>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contract: Vec<ContractEntrySpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

impl PipelineDefinition {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse pipeline YAML: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("pipeline")
    }
}

/// Directory that relative paths in a definition file resolve against.
pub fn definition_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
