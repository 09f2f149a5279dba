use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use serde_json::to_writer_pretty;
use stagecraft::artifacts::ArtifactStore;
use stagecraft::config::ArtifactBackendConfig;
use stagecraft::contract::{ContractEntry, Environment, EnvironmentContract};
use stagecraft::definition::{PipelineDefinition, definition_dir};
use stagecraft::executor::{CancellationToken, build_executor};
use stagecraft::lockfile::generate_lock;
use stagecraft::observability::log_snapshot;
use stagecraft::pipeline::Pipeline;
use stagecraft::presets::generate_preset;
use stagecraft::report::{RunReport, StageStatus};
use stagecraft::validation::{ValidationReport, validate_definition};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

fn main() -> Result<()> {
    let cli = Cli::parse();
    configure_tracing()?;

    match cli.command {
        Commands::Run {
            pipeline,
            dry_run,
            workers,
            fail_fast,
            report,
            print_metrics,
            metrics_json,
        } => run_pipeline(
            &pipeline,
            RunArgs {
                dry_run,
                workers,
                fail_fast,
                report,
                print_metrics,
                metrics_json,
            },
        ),
        Commands::Plan { pipeline } => plan_pipeline(&pipeline),
        Commands::Validate { pipeline } => validate_pipeline_cmd(&pipeline),
        Commands::Lint { pipelines } => lint_pipelines(&pipelines),
        Commands::Lock { pipeline, output } => lock_pipeline(&pipeline, &output),
        Commands::New { preset, output } => {
            let destination =
                output.unwrap_or_else(|| PathBuf::from(format!("pipelines/{preset}.yaml")));
            let generated = generate_preset(&preset, &destination)?;
            info!(
                preset = %preset,
                path = %generated.display(),
                "Preset pipeline generated"
            );
            Ok(())
        }
        Commands::CheckEnv { entries } => check_env(&entries),
        Commands::Artifact { action } => artifact_command(action),
        Commands::Completions { shell } => {
            let mut command = Cli::command();
            let name = command.get_name().to_string();
            clap_complete::generate(shell, &mut command, name, &mut io::stdout());
            Ok(())
        }
    }
}

fn configure_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))?;
    Ok(())
}

struct RunArgs {
    dry_run: bool,
    workers: Option<usize>,
    fail_fast: bool,
    report: Option<PathBuf>,
    print_metrics: bool,
    metrics_json: Option<PathBuf>,
}

fn run_pipeline(path: &Path, args: RunArgs) -> Result<()> {
    let mut definition = PipelineDefinition::load(path)?;
    ensure_valid(path, &validate_definition(&definition), "Cannot run pipeline")?;

    if let Some(workers) = args.workers {
        if workers == 0 {
            bail!("--workers must be at least 1");
        }
        definition.runtime.workers = workers;
    }
    definition.runtime.fail_fast |= args.fail_fast;

    if args.dry_run {
        let pipeline = Pipeline::from_definition(&definition)?;
        info!(
            pipeline = pipeline.name(),
            stages = pipeline.len(),
            workers = definition.runtime.workers,
            "Dry run: pipeline is valid, nothing executed"
        );
        print_plan(&pipeline);
        return Ok(());
    }

    let base_dir = definition_dir(path);
    let executor = build_executor(&definition, &base_dir)?;
    let metrics = executor.metrics();
    let report = executor.execute(&CancellationToken::new())?;

    summarize(&report);
    if let Some(report_path) = &args.report {
        report.write_json(report_path)?;
        info!(report = %report_path.display(), "Run report written");
    }

    if args.print_metrics || args.metrics_json.is_some() {
        let snapshot = metrics.snapshot();
        if args.print_metrics {
            log_snapshot(&snapshot);
        }
        if let Some(path) = &args.metrics_json {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create metrics directory: {}", parent.display())
                })?;
            }
            let file = File::create(path)
                .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
            to_writer_pretty(file, &snapshot)
                .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
            info!(metrics = %path.display(), "Metrics JSON written");
        }
    }

    if report.is_success() {
        Ok(())
    } else {
        bail!(
            "Pipeline '{}' failed: {} stage(s) failed, {} skipped",
            report.pipeline,
            report.count(StageStatus::Failed),
            report.count(StageStatus::Skipped)
        )
    }
}

fn summarize(report: &RunReport) {
    for result in &report.stages {
        match (&result.status, &result.error) {
            (StageStatus::Succeeded, _) => info!(
                stage = result.stage.as_str(),
                duration_ms = result.duration_ms().unwrap_or_default(),
                "succeeded"
            ),
            (status, Some(detail)) => warn!(
                stage = result.stage.as_str(),
                status = status.as_str(),
                kind = detail.kind.as_str(),
                "{}",
                detail.message
            ),
            (status, None) => warn!(
                stage = result.stage.as_str(),
                status = status.as_str(),
                "not completed"
            ),
        }
    }
}

fn plan_pipeline(path: &Path) -> Result<()> {
    let definition = PipelineDefinition::load(path)?;
    let pipeline = Pipeline::from_definition(&definition)
        .with_context(|| format!("Invalid pipeline: {}", path.display()))?;
    print_plan(&pipeline);
    Ok(())
}

fn print_plan(pipeline: &Pipeline) {
    println!("Pipeline '{}':", pipeline.name());
    for (position, &idx) in pipeline.order().iter().enumerate() {
        let stage = pipeline.stage(idx);
        let deps: Vec<&str> = pipeline
            .dependencies(idx)
            .iter()
            .map(|&dep| pipeline.stage(dep).name.as_str())
            .collect();
        if deps.is_empty() {
            println!("{:>3}. {}", position + 1, stage.name);
        } else {
            println!(
                "{:>3}. {} (after {})",
                position + 1,
                stage.name,
                deps.join(", ")
            );
        }
    }
}

fn ensure_valid(path: &Path, report: &ValidationReport, action: &str) -> Result<()> {
    for warning in &report.warnings {
        warn!(file = %path.display(), "{warning}");
    }
    if report.is_ok() {
        return Ok(());
    }
    for error_msg in &report.errors {
        error!(file = %path.display(), "{error_msg}");
    }
    Err(anyhow!(
        "{action}: {} validation error(s)",
        report.errors.len()
    ))
}

fn validate_pipeline_cmd(path: &Path) -> Result<()> {
    let definition = PipelineDefinition::load(path)?;
    ensure_valid(
        path,
        &validate_definition(&definition),
        "Pipeline validation failed",
    )?;
    info!(file = %path.display(), "Pipeline validation passed");
    Ok(())
}

fn lint_pipelines(paths: &[PathBuf]) -> Result<()> {
    if paths.is_empty() {
        bail!("No pipeline files supplied for linting");
    }

    let mut failures = 0usize;
    for path in paths {
        match PipelineDefinition::load(path) {
            Ok(definition) => {
                let report = validate_definition(&definition);
                if ensure_valid(path, &report, "Lint failed").is_ok() {
                    info!(file = %path.display(), "Lint passed");
                } else {
                    failures += 1;
                }
            }
            Err(err) => {
                failures += 1;
                error!(file = %path.display(), "Failed to load pipeline: {err:#}");
            }
        }
    }

    if failures > 0 {
        bail!("Lint failed for {failures} pipeline(s)");
    }
    info!("All pipeline lint checks passed");
    Ok(())
}

fn lock_pipeline(path: &Path, output_path: &Path) -> Result<()> {
    let definition = PipelineDefinition::load(path)?;
    ensure_valid(
        path,
        &validate_definition(&definition),
        "Cannot generate lockfile",
    )?;

    if let Some(parent) = output_path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create lockfile directory: {}", parent.display())
        })?;
    }
    generate_lock(&definition, output_path)?;
    info!(lockfile = %output_path.display(), "Lockfile generated successfully");
    Ok(())
}

/// Verifies this process's own environment, the way a stage would check itself.
fn check_env(raw_entries: &[String]) -> Result<()> {
    let entries = raw_entries
        .iter()
        .map(|raw| ContractEntry::parse(raw))
        .collect::<Result<Vec<_>, _>>()?;
    let contract = EnvironmentContract::new(entries)?;
    let actual: Environment = std::env::vars().collect();

    let violations = contract.violations(&actual);
    if violations.is_empty() {
        for entry in contract.entries() {
            println!("ok: {}", entry.key);
        }
        return Ok(());
    }
    for violation in &violations {
        error!(key = violation.key(), "{violation}");
    }
    bail!(
        "Environment check failed: {} of {} entries violated",
        violations.len(),
        contract.entries().len()
    )
}

fn artifact_command(action: ArtifactCommands) -> Result<()> {
    match action {
        ArtifactCommands::Get {
            name,
            pipeline,
            output,
        } => {
            let store = open_store(&pipeline)?;
            let bytes = store
                .read(&name)
                .with_context(|| format!("Failed to read artifact '{name}'"))?;
            match output {
                Some(path) => fs::write(&path, &bytes)
                    .with_context(|| format!("Failed to write {}", path.display()))?,
                None => io::stdout()
                    .write_all(&bytes)
                    .context("Failed to write artifact to stdout")?,
            }
            Ok(())
        }
        ArtifactCommands::Put {
            name,
            file,
            pipeline,
        } => {
            let store = open_store(&pipeline)?;
            let bytes = match &file {
                Some(path) => {
                    fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?
                }
                None => {
                    let mut buffer = Vec::new();
                    io::stdin()
                        .read_to_end(&mut buffer)
                        .context("Failed to read artifact from stdin")?;
                    buffer
                }
            };
            store
                .write(&name, &bytes)
                .with_context(|| format!("Failed to write artifact '{name}'"))?;
            let location = store.locate(&name)?;
            info!(
                artifact = %name,
                location = location.location_hint.as_str(),
                bytes = bytes.len(),
                "Artifact stored"
            );
            Ok(())
        }
    }
}

fn open_store(path: &Path) -> Result<Arc<dyn ArtifactStore>> {
    let definition = PipelineDefinition::load(path)?;
    if matches!(definition.runtime.artifacts, ArtifactBackendConfig::Memory) {
        bail!(
            "Pipeline {} uses the memory artifact backend, which does not persist between commands",
            path.display()
        );
    }
    definition
        .runtime
        .build_artifact_store(&definition_dir(path))
}

#[derive(Parser)]
#[command(
    name = "stagecraft",
    version,
    about = "Runs multi-stage pipelines and verifies each stage's environment and artifacts"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute every stage of a pipeline definition.
    Run {
        pipeline: PathBuf,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        fail_fast: bool,
        /// Write the run report as JSON.
        #[arg(long)]
        report: Option<PathBuf>,
        #[arg(long)]
        print_metrics: bool,
        #[arg(long = "metrics-json")]
        metrics_json: Option<PathBuf>,
    },
    /// Print the execution order without running anything.
    Plan {
        pipeline: PathBuf,
    },
    Validate {
        pipeline: PathBuf,
    },
    Lint {
        #[arg(required = true)]
        pipelines: Vec<PathBuf>,
    },
    Lock {
        pipeline: PathBuf,
        output: PathBuf,
    },
    /// Generate a pipeline definition from a preset.
    New {
        #[arg(long)]
        preset: String,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Check the current environment against KEY=VALUE or KEY entries.
    CheckEnv {
        #[arg(required = true, value_name = "KEY[=VALUE]")]
        entries: Vec<String>,
    },
    Artifact {
        #[command(subcommand)]
        action: ArtifactCommands,
    },
    Completions {
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum ArtifactCommands {
    Get {
        name: String,
        #[arg(long)]
        pipeline: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Store a file (or stdin) under an artifact name.
    Put {
        name: String,
        file: Option<PathBuf>,
        #[arg(long)]
        pipeline: PathBuf,
    },
}
