use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::artifacts::{ArtifactError, ArtifactStore};
use crate::contract::{ContractViolation, Environment, EnvironmentContract};
use crate::secrets::{SecretBinding, SecretError};

/// Bytes of stderr kept in an `ExecutionFailed` message.
const STDERR_TAIL_BYTES: usize = 2048;

#[derive(Debug, Error)]
pub enum StageError {
    #[error("stage '{stage}' environment check failed: {source}")]
    BadEnvironment {
        stage: String,
        #[source]
        source: ContractViolation,
    },
    #[error("stage '{stage}' is missing input artifact '{artifact}'")]
    MissingInput { stage: String, artifact: String },
    #[error("stage '{stage}' did not produce declared output artifact '{artifact}'")]
    MissingOutput { stage: String, artifact: String },
    #[error("stage '{stage}' failed ({}): {message}", describe_exit(.exit_code))]
    ExecutionFailed {
        stage: String,
        exit_code: Option<i32>,
        message: String,
    },
    #[error("stage '{stage}' could not resolve secret for '{inject_as}': {source}")]
    SecretUnavailable {
        stage: String,
        inject_as: String,
        #[source]
        source: SecretError,
    },
    #[error("stage '{stage}' artifact check failed: {source}")]
    Artifact {
        stage: String,
        #[source]
        source: ArtifactError,
    },
}

impl StageError {
    /// Stable, machine-readable error kind used in run reports.
    pub fn kind(&self) -> &'static str {
        match self {
            StageError::BadEnvironment { .. } => "bad_environment",
            StageError::MissingInput { .. } => "missing_input",
            StageError::MissingOutput { .. } => "missing_output",
            StageError::ExecutionFailed { .. } => "execution_failed",
            StageError::SecretUnavailable { .. } => "secret_unavailable",
            StageError::Artifact { .. } => "artifact_error",
        }
    }
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "no exit code".to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Overrides the runtime workdir for this stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            working_dir: None,
        }
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Everything a launcher needs to start one stage process.
#[derive(Debug)]
pub struct LaunchRequest<'a> {
    pub stage: &'a str,
    pub command: &'a CommandSpec,
    pub env: &'a Environment,
    pub working_dir: &'a Path,
}

#[derive(Debug, Clone, Default)]
pub struct LaunchOutcome {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl LaunchOutcome {
    pub fn success() -> Self {
        Self {
            exit_code: Some(0),
            ..Self::default()
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stdout: Vec::new(),
            stderr: stderr.into(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Process-spawning seam; blocks until the stage process exits.
pub trait Launcher: Send + Sync {
    fn launch(&self, request: &LaunchRequest<'_>) -> std::io::Result<LaunchOutcome>;
}

/// Spawns stages as child processes with exactly the requested environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

impl Launcher for ProcessLauncher {
    fn launch(&self, request: &LaunchRequest<'_>) -> std::io::Result<LaunchOutcome> {
        let output = Command::new(&request.command.program)
            .args(&request.command.args)
            .current_dir(request.working_dir)
            .env_clear()
            .envs(request.env)
            .output()?;
        Ok(LaunchOutcome {
            exit_code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// One executable unit of pipeline work. Immutable once built.
#[derive(Debug, Clone)]
pub struct Stage {
    pub name: String,
    pub command: CommandSpec,
    pub contract: EnvironmentContract,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub env: Environment,
    pub secrets: Vec<SecretBinding>,
    pub depends_on: Vec<String>,
}

impl Stage {
    pub fn new(name: impl Into<String>, command: CommandSpec) -> Self {
        Self {
            name: name.into(),
            command,
            contract: EnvironmentContract::default(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            env: Environment::new(),
            secrets: Vec::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn with_contract(mut self, contract: EnvironmentContract) -> Self {
        self.contract = contract;
        self
    }

    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_outputs<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = outputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_secret(mut self, key: impl Into<String>, inject_as: impl Into<String>) -> Self {
        self.secrets.push(SecretBinding {
            key: key.into(),
            inject_as: inject_as.into(),
        });
        self
    }

    pub fn with_dependency(mut self, stage: impl Into<String>) -> Self {
        self.depends_on.push(stage.into());
        self
    }

    /// Verifies preconditions, runs the executable, then verifies declared outputs.
    ///
    /// Environment and input failures are reported before anything is spawned.
    pub fn run(
        &self,
        env: &Environment,
        artifacts: &dyn ArtifactStore,
        launcher: &dyn Launcher,
        working_dir: &Path,
    ) -> Result<(), StageError> {
        self.contract
            .verify(env)
            .map_err(|source| StageError::BadEnvironment {
                stage: self.name.clone(),
                source,
            })?;

        for input in &self.inputs {
            if !self.artifact_exists(artifacts, input)? {
                return Err(StageError::MissingInput {
                    stage: self.name.clone(),
                    artifact: input.clone(),
                });
            }
        }

        let working_dir = match &self.command.working_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => working_dir.join(dir),
            None => working_dir.to_path_buf(),
        };
        let request = LaunchRequest {
            stage: &self.name,
            command: &self.command,
            env,
            working_dir: &working_dir,
        };
        debug!(command = %self.command.display(), cwd = %working_dir.display(), "Launching stage");
        let outcome = launcher
            .launch(&request)
            .map_err(|err| StageError::ExecutionFailed {
                stage: self.name.clone(),
                exit_code: None,
                message: format!("failed to start '{}': {err}", self.command.program),
            })?;

        for line in String::from_utf8_lossy(&outcome.stdout).lines() {
            debug!(stage = self.name.as_str(), "{line}");
        }
        if !outcome.succeeded() {
            return Err(StageError::ExecutionFailed {
                stage: self.name.clone(),
                exit_code: outcome.exit_code,
                message: failure_message(&outcome),
            });
        }

        for output in &self.outputs {
            if !self.artifact_exists(artifacts, output)? {
                return Err(StageError::MissingOutput {
                    stage: self.name.clone(),
                    artifact: output.clone(),
                });
            }
        }
        Ok(())
    }

    fn artifact_exists(&self, artifacts: &dyn ArtifactStore, name: &str) -> Result<bool, StageError> {
        artifacts.exists(name).map_err(|source| StageError::Artifact {
            stage: self.name.clone(),
            source,
        })
    }
}

fn failure_message(outcome: &LaunchOutcome) -> String {
    let stderr = String::from_utf8_lossy(&outcome.stderr);
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        return match outcome.exit_code {
            Some(_) => "process exited unsuccessfully".to_string(),
            None => "process terminated by signal".to_string(),
        };
    }
    if trimmed.len() <= STDERR_TAIL_BYTES {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - STDERR_TAIL_BYTES;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &trimmed[start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_message_keeps_stderr_tail() {
        let long = "x".repeat(STDERR_TAIL_BYTES + 10);
        let outcome = LaunchOutcome::failure(1, format!("head\n{long}"));
        let message = failure_message(&outcome);
        assert!(message.starts_with("..."));
        assert!(!message.contains("head"));
    }

    #[test]
    fn failure_message_for_signal_without_stderr() {
        let outcome = LaunchOutcome {
            exit_code: None,
            ..LaunchOutcome::default()
        };
        assert_eq!(failure_message(&outcome), "process terminated by signal");
    }

    #[test]
    fn command_display_joins_arguments() {
        let command = CommandSpec::new("python", ["train.py", "--epochs", "3"]);
        assert_eq!(command.display(), "python train.py --epochs 3");
    }
}
