use std::collections::HashSet;

use serde::Serialize;

use crate::config::ArtifactBackendConfig;
use crate::definition::{CURRENT_VERSION, PipelineDefinition};
use crate::pipeline::{Pipeline, stage_from_spec};
use crate::stage::Stage;

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// Collects every problem in a definition instead of stopping at the first.
pub fn validate_definition(definition: &PipelineDefinition) -> ValidationReport {
    let mut report = ValidationReport::default();

    if definition.version != CURRENT_VERSION {
        report.errors.push(format!(
            "Unsupported pipeline version: {}",
            definition.version
        ));
    }
    report.errors.extend(definition.runtime.validate());

    if definition.pipeline.is_empty() {
        report
            .errors
            .push("Pipeline must contain at least one stage".into());
        return report;
    }

    let mut stages = Vec::with_capacity(definition.pipeline.len());
    for (idx, spec) in definition.pipeline.iter().enumerate() {
        match stage_from_spec(idx, spec) {
            Ok(stage) => stages.push(stage),
            Err(err) => report
                .errors
                .push(format!("Stage {} ('{}'): {err}", idx + 1, spec.name)),
        }
    }
    if stages.len() != definition.pipeline.len() {
        return report;
    }

    for stage in &stages {
        report.merge(validate_stage_environment(definition, stage));
    }
    report.merge(validate_external_inputs(&stages));
    if matches!(definition.runtime.artifacts, ArtifactBackendConfig::Memory) {
        for stage in stages.iter().filter(|stage| !stage.outputs.is_empty()) {
            report.warnings.push(format!(
                "Stage '{}' declares outputs but the memory artifact backend cannot see files written by stage processes",
                stage.name
            ));
        }
    }

    if let Err(err) = Pipeline::new(stages) {
        report.errors.push(err.to_string());
    }

    report
}

fn validate_stage_environment(definition: &PipelineDefinition, stage: &Stage) -> ValidationReport {
    let mut report = ValidationReport::default();
    let supplied: HashSet<&str> = definition
        .runtime
        .inherit_env
        .iter()
        .map(String::as_str)
        .chain(definition.env.keys().map(String::as_str))
        .chain(stage.env.keys().map(String::as_str))
        .chain(stage.secrets.iter().map(|b| b.inject_as.as_str()))
        .collect();

    for key in stage.contract.keys() {
        if !supplied.contains(key) {
            report.warnings.push(format!(
                "Stage '{}' requires '{}' but no env, secret or inherited variable supplies it",
                stage.name, key
            ));
        }
    }

    for entry in stage.contract.entries() {
        let Some(expected) = &entry.value else {
            continue;
        };
        let configured = stage
            .env
            .get(&entry.key)
            .or_else(|| definition.env.get(&entry.key));
        if let Some(configured) = configured
            && configured != expected
        {
            report.errors.push(format!(
                "Stage '{}' sets {}='{}' but its contract expects '{}'",
                stage.name, entry.key, configured, expected
            ));
        }
    }
    report
}

fn validate_external_inputs(stages: &[Stage]) -> ValidationReport {
    let mut report = ValidationReport::default();
    let produced: HashSet<&str> = stages
        .iter()
        .flat_map(|stage| stage.outputs.iter().map(String::as_str))
        .collect();
    for stage in stages {
        for input in &stage.inputs {
            if !produced.contains(input.as_str()) {
                report.warnings.push(format!(
                    "Stage '{}' input '{}' is not produced by any stage and must exist before the run",
                    stage.name, input
                ));
            }
        }
    }
    report
}
