use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::definition::{PipelineDefinition, StageSpec};
use crate::pipeline::Pipeline;

#[derive(Debug, Serialize)]
pub struct PipelineLock {
    pub version: u32,
    pub pipeline: String,
    pub generated_at: DateTime<Utc>,
    /// Stage names in the order the executor considers them.
    pub execution_order: Vec<String>,
    pub stages: Vec<StageLock>,
}

#[derive(Debug, Serialize)]
pub struct StageLock {
    pub name: String,
    pub command: String,
    pub definition_hash: String,
}

pub fn build_lock(definition: &PipelineDefinition) -> Result<PipelineLock> {
    let pipeline = Pipeline::from_definition(definition)
        .with_context(|| format!("Invalid pipeline '{}'", definition.display_name()))?;
    let stages = definition
        .pipeline
        .iter()
        .map(|spec| {
            Ok(StageLock {
                name: spec.name.clone(),
                command: spec.command.display(),
                definition_hash: hash_stage(spec)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(PipelineLock {
        version: definition.version,
        pipeline: definition.display_name().to_string(),
        generated_at: Utc::now(),
        execution_order: pipeline
            .order()
            .iter()
            .map(|&idx| pipeline.stage(idx).name.clone())
            .collect(),
        stages,
    })
}

pub fn generate_lock(definition: &PipelineDefinition, path: &Path) -> Result<()> {
    let lock = build_lock(definition)?;
    let file = File::create(path)
        .with_context(|| format!("Failed to create lockfile: {}", path.display()))?;
    serde_yaml::to_writer(file, &lock)
        .with_context(|| format!("Failed to write lockfile: {}", path.display()))?;
    Ok(())
}

/// SHA-256 over the stage's canonical JSON form; secret values are not part of it.
pub fn hash_stage(spec: &StageSpec) -> Result<String> {
    let serialized = serde_json::to_vec(spec)
        .with_context(|| format!("Failed to serialize stage '{}'", spec.name))?;
    let mut hasher = Sha256::new();
    hasher.update(spec.name.as_bytes());
    hasher.update(serialized);
    Ok(format!("{:x}", hasher.finalize()))
}
