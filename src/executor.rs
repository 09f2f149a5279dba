use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{Span, error, info, info_span, warn};

use crate::artifacts::{ArtifactRef, ArtifactStore};
use crate::config::RuntimeConfig;
use crate::contract::Environment;
use crate::definition::PipelineDefinition;
use crate::observability::MetricsCollector;
use crate::pipeline::{Pipeline, PipelineError};
use crate::report::{ErrorDetail, RunReport, RunStatus, StageResult, StageStatus};
use crate::secrets::{NoSecrets, SecretStore};
use crate::stage::{Launcher, ProcessLauncher, StageError};

/// Cooperative cancellation shared between the caller and a running executor.
///
/// Cancelling stops dispatch of stages that have not started; running stages
/// are left to finish.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub workers: usize,
    pub workdir: PathBuf,
    pub inherit_env: Vec<String>,
    pub fail_fast: bool,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            workdir: PathBuf::from("."),
            inherit_env: Vec::new(),
            fail_fast: false,
        }
    }
}

impl ExecutorOptions {
    pub fn from_runtime(config: &RuntimeConfig, base_dir: &Path) -> Self {
        Self {
            workers: config.workers.max(1),
            workdir: config.resolve_workdir(base_dir),
            inherit_env: config.inherit_env.clone(),
            fail_fast: config.fail_fast,
        }
    }
}

struct Completion {
    idx: usize,
    outcome: Result<Vec<ArtifactRef>, StageError>,
    finished_at: DateTime<Utc>,
}

pub struct PipelineExecutor {
    pipeline: Pipeline,
    artifacts: Arc<dyn ArtifactStore>,
    secrets: Arc<dyn SecretStore>,
    launcher: Arc<dyn Launcher>,
    options: ExecutorOptions,
    metrics: MetricsCollector,
    state: Mutex<RunState>,
}

impl PipelineExecutor {
    pub fn new(pipeline: Pipeline, artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self {
            pipeline,
            artifacts,
            secrets: Arc::new(NoSecrets),
            launcher: Arc::new(ProcessLauncher),
            options: ExecutorOptions::default(),
            metrics: MetricsCollector::new(),
            state: Mutex::new(RunState::Idle),
        }
    }

    pub fn with_secrets(mut self, secrets: Arc<dyn SecretStore>) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    pub fn artifacts(&self) -> Arc<dyn ArtifactStore> {
        self.artifacts.clone()
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    pub fn state(&self) -> RunState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs every stage once and reports each stage's terminal status.
    ///
    /// Stage failures are recorded in the report; only a concurrent second run
    /// is refused with an error.
    pub fn execute(&self, cancel: &CancellationToken) -> Result<RunReport, PipelineError> {
        self.transition_to_running()?;
        self.metrics.reset();
        let clock = Instant::now();
        let started_at = Utc::now();
        let span = info_span!("pipeline", pipeline = self.pipeline.name());
        let (results, cancelled) = span.in_scope(|| {
            info!(
                stages = self.pipeline.len(),
                workers = self.options.workers,
                "Pipeline run started"
            );
            self.run_stages(cancel, &span)
        });

        let status = if results.iter().any(|r| r.status == StageStatus::Failed) {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        self.metrics.record_total_duration(clock.elapsed());
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = match status {
            RunStatus::Completed => RunState::Completed,
            RunStatus::Failed => RunState::Failed,
        };

        let report = RunReport {
            pipeline: self.pipeline.name().to_string(),
            status,
            cancelled,
            started_at,
            finished_at: Utc::now(),
            stages: results,
        };
        info!(
            pipeline = report.pipeline.as_str(),
            status = ?report.status,
            succeeded = report.count(StageStatus::Succeeded),
            failed = report.count(StageStatus::Failed),
            skipped = report.count(StageStatus::Skipped),
            "Pipeline run finished"
        );
        Ok(report)
    }

    fn transition_to_running(&self) -> Result<(), PipelineError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == RunState::Running {
            return Err(PipelineError::RunInProgress);
        }
        *state = RunState::Running;
        Ok(())
    }

    /// Returns the stage results and whether any stage was skipped because of
    /// cancellation.
    fn run_stages(&self, cancel: &CancellationToken, run_span: &Span) -> (Vec<StageResult>, bool) {
        let pipeline = &self.pipeline;
        let mut results: Vec<StageResult> = pipeline
            .stages()
            .iter()
            .map(|stage| StageResult::pending(&stage.name))
            .collect();
        let workers = self.options.workers.clamp(1, pipeline.len().max(1));
        let mut halted = false;
        let mut cancelled = false;

        let (job_tx, job_rx) = mpsc::channel::<usize>();
        let job_rx = Mutex::new(job_rx);
        let (done_tx, done_rx) = mpsc::channel::<Completion>();
        thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = &job_rx;
                let done_tx = done_tx.clone();
                scope.spawn(move || self.worker_loop(job_rx, done_tx, run_span));
            }
            drop(done_tx);

            let mut in_flight = 0usize;
            loop {
                for &idx in pipeline.order() {
                    if results[idx].status != StageStatus::Pending {
                        continue;
                    }
                    let deps = pipeline.dependencies(idx);
                    if deps.iter().any(|&dep| !results[dep].status.is_terminal()) {
                        continue;
                    }
                    let stage_name = pipeline.stage(idx).name.as_str();
                    if let Some(&blocked) = deps
                        .iter()
                        .find(|&&dep| results[dep].status.blocks_dependents())
                    {
                        let reason = format!(
                            "upstream stage '{}' {}",
                            pipeline.stage(blocked).name,
                            results[blocked].status.as_str()
                        );
                        warn!(stage = stage_name, "Skipping stage: {reason}");
                        self.skip(&mut results[idx], reason);
                        continue;
                    }
                    if cancel.is_cancelled() {
                        warn!(stage = stage_name, "Skipping stage: run cancelled");
                        self.skip(&mut results[idx], "run cancelled before dispatch");
                        cancelled = true;
                        continue;
                    }
                    if halted {
                        warn!(stage = stage_name, "Skipping stage: fail-fast after failure");
                        self.skip(&mut results[idx], "dispatch halted after an earlier failure");
                        continue;
                    }
                    if in_flight >= workers {
                        continue;
                    }
                    results[idx].start(Utc::now());
                    info!(stage = stage_name, "Stage started");
                    if job_tx.send(idx).is_err() {
                        self.fail_unreported(&mut results[idx]);
                        continue;
                    }
                    in_flight += 1;
                }

                if in_flight == 0 {
                    break;
                }
                match done_rx.recv() {
                    Ok(completion) => {
                        in_flight -= 1;
                        let failed = self.record_completion(&mut results, completion);
                        halted |= failed && self.options.fail_fast;
                    }
                    Err(_) => {
                        // Every worker is gone; nothing in flight will report back.
                        for result in results
                            .iter_mut()
                            .filter(|r| r.status == StageStatus::Running)
                        {
                            self.fail_unreported(result);
                        }
                        in_flight = 0;
                        halted = true;
                    }
                }
            }
            drop(job_tx);
        });

        (results, cancelled)
    }

    fn worker_loop(&self, jobs: &Mutex<Receiver<usize>>, done: Sender<Completion>, run_span: &Span) {
        loop {
            let next = match jobs.lock() {
                Ok(receiver) => receiver.recv(),
                Err(_) => return,
            };
            let Ok(idx) = next else {
                return;
            };
            let stage_span = info_span!(parent: run_span, "stage", stage = self.pipeline.stage(idx).name.as_str());
            let outcome = stage_span.in_scope(|| {
                panic::catch_unwind(AssertUnwindSafe(|| self.execute_stage(idx))).unwrap_or_else(
                    |payload| {
                        Err(StageError::ExecutionFailed {
                            stage: self.pipeline.stage(idx).name.clone(),
                            exit_code: None,
                            message: format!("stage panicked: {}", panic_message(payload.as_ref())),
                        })
                    },
                )
            });
            let completion = Completion {
                idx,
                outcome,
                finished_at: Utc::now(),
            };
            if done.send(completion).is_err() {
                return;
            }
        }
    }

    fn execute_stage(&self, idx: usize) -> Result<Vec<ArtifactRef>, StageError> {
        let stage = self.pipeline.stage(idx);
        let _timer = self.metrics.start_stage(&stage.name);
        let env = self.assemble_environment(idx)?;
        stage.run(
            &env,
            self.artifacts.as_ref(),
            self.launcher.as_ref(),
            &self.options.workdir,
        )?;
        stage
            .outputs
            .iter()
            .map(|name| {
                self.artifacts
                    .locate(name)
                    .map_err(|source| StageError::Artifact {
                        stage: stage.name.clone(),
                        source,
                    })
            })
            .collect()
    }

    /// Merges, lowest precedence first: inherited variables, pipeline env,
    /// stage env, injected secrets.
    pub fn assemble_environment(&self, idx: usize) -> Result<Environment, StageError> {
        let stage = self.pipeline.stage(idx);
        let mut env = Environment::new();
        for key in &self.options.inherit_env {
            if let Ok(value) = std::env::var(key) {
                env.insert(key.clone(), value);
            }
        }
        env.extend(
            self.pipeline
                .env()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        env.extend(stage.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        for binding in &stage.secrets {
            let value =
                self.secrets
                    .fetch(&binding.key)
                    .map_err(|source| StageError::SecretUnavailable {
                        stage: stage.name.clone(),
                        inject_as: binding.inject_as.clone(),
                        source,
                    })?;
            env.insert(binding.inject_as.clone(), value);
        }
        Ok(env)
    }

    /// Returns whether the stage failed.
    fn record_completion(&self, results: &mut [StageResult], completion: Completion) -> bool {
        let stage_name = self.pipeline.stage(completion.idx).name.as_str();
        let result = &mut results[completion.idx];
        match completion.outcome {
            Ok(outputs) => {
                result.succeed(completion.finished_at, outputs);
                info!(
                    stage = stage_name,
                    duration_ms = result.duration_ms().unwrap_or_default(),
                    "Stage succeeded"
                );
                self.metrics.record_outcome(StageStatus::Succeeded);
                false
            }
            Err(err) => {
                error!(stage = stage_name, kind = err.kind(), error = %err, "Stage failed");
                result.fail(completion.finished_at, ErrorDetail::from(&err));
                self.metrics.record_outcome(StageStatus::Failed);
                true
            }
        }
    }

    fn skip(&self, result: &mut StageResult, reason: impl Into<String>) {
        result.skip(Utc::now(), reason);
        self.metrics.record_outcome(StageStatus::Skipped);
    }

    fn fail_unreported(&self, result: &mut StageResult) {
        error!(stage = result.stage.as_str(), "Stage worker terminated without a result");
        result.fail(
            Utc::now(),
            ErrorDetail {
                kind: "executor".to_string(),
                message: "worker terminated before reporting a result".to_string(),
            },
        );
        self.metrics.record_outcome(StageStatus::Failed);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic payload"
    }
}

/// Builds an executor for a loaded definition, wiring the configured backends.
pub fn build_executor(
    definition: &PipelineDefinition,
    base_dir: &Path,
) -> Result<PipelineExecutor> {
    let pipeline = Pipeline::from_definition(definition)
        .with_context(|| format!("Invalid pipeline '{}'", definition.display_name()))?;
    let runtime = &definition.runtime;
    let artifacts = runtime.build_artifact_store(base_dir)?;
    let secrets = runtime.build_secret_store(base_dir)?;
    let options = ExecutorOptions::from_runtime(runtime, base_dir);
    std::fs::create_dir_all(&options.workdir).with_context(|| {
        format!("Failed to create workdir: {}", options.workdir.display())
    })?;
    Ok(PipelineExecutor::new(pipeline, artifacts)
        .with_secrets(secrets)
        .with_options(options))
}
