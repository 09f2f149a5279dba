use std::collections::{BTreeSet, HashMap};

use thiserror::Error;

use crate::artifacts::{ArtifactError, validate_name};
use crate::contract::{ContractError, Environment, EnvironmentContract};
use crate::definition::{CURRENT_VERSION, PipelineDefinition, StageSpec};
use crate::stage::Stage;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline must contain at least one stage")]
    EmptyPipeline,
    #[error("unsupported pipeline version {0} (expected {CURRENT_VERSION})")]
    UnsupportedVersion(u32),
    #[error("stage {position} has an empty name")]
    EmptyStageName { position: usize },
    #[error("stage '{0}' is declared more than once")]
    DuplicateStage(String),
    #[error("stage '{stage}' has an empty command")]
    EmptyCommand { stage: String },
    #[error("stage '{stage}' has an invalid contract: {source}")]
    InvalidContract {
        stage: String,
        #[source]
        source: ContractError,
    },
    #[error("stage '{stage}' declares an invalid artifact: {source}")]
    InvalidArtifact {
        stage: String,
        #[source]
        source: ArtifactError,
    },
    #[error("stage '{stage}' has an invalid secret binding: {reason}")]
    InvalidSecret { stage: String, reason: String },
    #[error("artifact '{artifact}' is produced by both '{first}' and '{second}'")]
    DuplicateProducer {
        artifact: String,
        first: String,
        second: String,
    },
    #[error("stage '{stage}' depends on unknown stage '{dependency}'")]
    UnknownDependency { stage: String, dependency: String },
    #[error("cyclic dependency between stages: {}", .stages.join(" -> "))]
    CyclicDependency { stages: Vec<String> },
    #[error("a run is already in progress for this executor")]
    RunInProgress,
}

/// Validated, immutable stage graph.
///
/// Stage indices follow declaration order. `dependencies[i]` lists the stages
/// that must reach a terminal status before stage `i` may start.
#[derive(Debug, Clone)]
pub struct Pipeline {
    name: String,
    env: Environment,
    stages: Vec<Stage>,
    dependencies: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl Pipeline {
    pub fn new(stages: Vec<Stage>) -> Result<Self, PipelineError> {
        if stages.is_empty() {
            return Err(PipelineError::EmptyPipeline);
        }
        for (idx, stage) in stages.iter().enumerate() {
            if stage.name.trim().is_empty() {
                return Err(PipelineError::EmptyStageName { position: idx + 1 });
            }
            if stage.command.program.trim().is_empty() {
                return Err(PipelineError::EmptyCommand {
                    stage: stage.name.clone(),
                });
            }
        }
        let dependencies = build_dependencies(&stages)?;
        let order = topological_order(&stages, &dependencies)?;
        Ok(Self {
            name: "pipeline".to_string(),
            env: Environment::new(),
            stages,
            dependencies,
            order,
        })
    }

    pub fn from_definition(definition: &PipelineDefinition) -> Result<Self, PipelineError> {
        if definition.version != CURRENT_VERSION {
            return Err(PipelineError::UnsupportedVersion(definition.version));
        }
        let stages = definition
            .pipeline
            .iter()
            .enumerate()
            .map(|(idx, spec)| stage_from_spec(idx, spec))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(stages)?
            .with_name(definition.display_name())
            .with_env(definition.env.clone()))
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_env(mut self, env: Environment) -> Self {
        self.env = env;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Variables shared by every stage.
    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage(&self, idx: usize) -> &Stage {
        &self.stages[idx]
    }

    pub fn dependencies(&self, idx: usize) -> &[usize] {
        &self.dependencies[idx]
    }

    /// Stage indices in dependency order; ties keep declaration order.
    pub fn order(&self) -> &[usize] {
        &self.order
    }
}

/// Builds a [`Stage`] from its definition, checking everything local to the stage.
pub fn stage_from_spec(position: usize, spec: &StageSpec) -> Result<Stage, PipelineError> {
    let name = spec.name.trim();
    if name.is_empty() {
        return Err(PipelineError::EmptyStageName {
            position: position + 1,
        });
    }
    if spec.command.program.trim().is_empty() {
        return Err(PipelineError::EmptyCommand {
            stage: name.to_string(),
        });
    }
    let contract = EnvironmentContract::from_specs(&spec.contract).map_err(|source| {
        PipelineError::InvalidContract {
            stage: name.to_string(),
            source,
        }
    })?;
    for artifact in spec.inputs.iter().chain(&spec.outputs) {
        validate_name(artifact).map_err(|source| PipelineError::InvalidArtifact {
            stage: name.to_string(),
            source,
        })?;
    }
    for binding in &spec.secrets {
        if binding.key.trim().is_empty() || binding.inject_as.trim().is_empty() {
            return Err(PipelineError::InvalidSecret {
                stage: name.to_string(),
                reason: "both 'key' and 'inject_as' must be set".to_string(),
            });
        }
    }

    let mut stage = Stage::new(name, spec.command.clone())
        .with_contract(contract)
        .with_inputs(spec.inputs.iter().cloned())
        .with_outputs(spec.outputs.iter().cloned());
    stage.env = spec.env.clone();
    stage.secrets = spec.secrets.clone();
    stage.depends_on = spec.depends_on.clone();
    Ok(stage)
}

fn build_dependencies(stages: &[Stage]) -> Result<Vec<Vec<usize>>, PipelineError> {
    let mut by_name: HashMap<&str, usize> = HashMap::with_capacity(stages.len());
    for (idx, stage) in stages.iter().enumerate() {
        if by_name.insert(stage.name.as_str(), idx).is_some() {
            return Err(PipelineError::DuplicateStage(stage.name.clone()));
        }
    }

    let mut producers: HashMap<&str, usize> = HashMap::new();
    for (idx, stage) in stages.iter().enumerate() {
        for output in &stage.outputs {
            if let Some(first) = producers.insert(output.as_str(), idx)
                && first != idx
            {
                return Err(PipelineError::DuplicateProducer {
                    artifact: output.clone(),
                    first: stages[first].name.clone(),
                    second: stage.name.clone(),
                });
            }
        }
    }

    let mut dependencies = Vec::with_capacity(stages.len());
    for (idx, stage) in stages.iter().enumerate() {
        let mut deps = BTreeSet::new();
        for dependency in &stage.depends_on {
            let dep_idx =
                *by_name
                    .get(dependency.as_str())
                    .ok_or_else(|| PipelineError::UnknownDependency {
                        stage: stage.name.clone(),
                        dependency: dependency.clone(),
                    })?;
            if dep_idx == idx {
                return Err(PipelineError::CyclicDependency {
                    stages: vec![stage.name.clone(), stage.name.clone()],
                });
            }
            deps.insert(dep_idx);
        }
        // A stage that rewrites its own input does not depend on itself.
        for input in &stage.inputs {
            if let Some(&producer) = producers.get(input.as_str())
                && producer != idx
            {
                deps.insert(producer);
            }
        }
        dependencies.push(deps.into_iter().collect());
    }
    Ok(dependencies)
}

fn topological_order(
    stages: &[Stage],
    dependencies: &[Vec<usize>],
) -> Result<Vec<usize>, PipelineError> {
    let mut remaining: Vec<usize> = dependencies.iter().map(Vec::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); stages.len()];
    for (idx, deps) in dependencies.iter().enumerate() {
        for &dep in deps {
            dependents[dep].push(idx);
        }
    }

    let mut ready: BTreeSet<usize> = remaining
        .iter()
        .enumerate()
        .filter_map(|(idx, count)| (*count == 0).then_some(idx))
        .collect();
    let mut order = Vec::with_capacity(stages.len());
    while let Some(idx) = ready.pop_first() {
        order.push(idx);
        for &dependent in &dependents[idx] {
            remaining[dependent] -= 1;
            if remaining[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() == stages.len() {
        Ok(order)
    } else {
        Err(PipelineError::CyclicDependency {
            stages: find_cycle(stages, dependencies, &remaining),
        })
    }
}

/// Walks unresolved dependency edges until a stage repeats.
fn find_cycle(stages: &[Stage], dependencies: &[Vec<usize>], remaining: &[usize]) -> Vec<String> {
    let unresolved = |idx: usize| remaining[idx] > 0;
    let Some(start) = (0..stages.len()).find(|&idx| unresolved(idx)) else {
        return Vec::new();
    };
    let mut path = vec![start];
    let mut current = start;
    loop {
        let Some(&next) = dependencies[current].iter().find(|&&dep| unresolved(dep)) else {
            break;
        };
        if let Some(pos) = path.iter().position(|&seen| seen == next) {
            // Reversed so the list reads in execution direction.
            let mut cycle: Vec<String> = path[pos..]
                .iter()
                .rev()
                .map(|&idx| stages[idx].name.clone())
                .collect();
            cycle.push(cycle[0].clone());
            return cycle;
        }
        path.push(next);
        current = next;
    }
    path.iter().map(|&idx| stages[idx].name.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::CommandSpec;

    fn stage(name: &str) -> Stage {
        Stage::new(name, CommandSpec::new("true", Vec::<String>::new()))
    }

    fn names(pipeline: &Pipeline) -> Vec<&str> {
        pipeline
            .order()
            .iter()
            .map(|&idx| pipeline.stage(idx).name.as_str())
            .collect()
    }

    #[test]
    fn order_follows_artifact_edges() {
        let pipeline = Pipeline::new(vec![
            stage("save").with_inputs(["models/model.txt"]),
            stage("train")
                .with_inputs(["data/data.txt"])
                .with_outputs(["models/model.txt"]),
            stage("prepdata").with_outputs(["data/data.txt"]),
        ])
        .unwrap();
        assert_eq!(names(&pipeline), vec!["prepdata", "train", "save"]);
    }

    #[test]
    fn ties_keep_declaration_order() {
        let pipeline = Pipeline::new(vec![
            stage("c").with_dependency("root"),
            stage("root"),
            stage("a").with_dependency("root"),
            stage("b"),
        ])
        .unwrap();
        assert_eq!(names(&pipeline), vec!["root", "c", "a", "b"]);
    }

    #[test]
    fn cycle_is_reported_with_stage_names() {
        let err = Pipeline::new(vec![
            stage("a").with_dependency("c"),
            stage("b").with_dependency("a"),
            stage("c").with_dependency("b"),
            stage("d"),
        ])
        .unwrap_err();
        match err {
            PipelineError::CyclicDependency { stages } => {
                assert_eq!(stages.first(), stages.last());
                assert_eq!(stages.len(), 4);
                assert!(!stages.contains(&"d".to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let err = Pipeline::new(vec![stage("a").with_dependency("a")]).unwrap_err();
        assert!(matches!(err, PipelineError::CyclicDependency { .. }));
    }

    #[test]
    fn unknown_dependency_and_duplicates_are_rejected() {
        assert!(matches!(
            Pipeline::new(vec![stage("a").with_dependency("ghost")]),
            Err(PipelineError::UnknownDependency { .. })
        ));
        assert!(matches!(
            Pipeline::new(vec![stage("a"), stage("a")]),
            Err(PipelineError::DuplicateStage(name)) if name == "a"
        ));
        assert!(matches!(
            Pipeline::new(vec![
                stage("a").with_outputs(["x.bin"]),
                stage("b").with_outputs(["x.bin"]),
            ]),
            Err(PipelineError::DuplicateProducer { .. })
        ));
    }
}
