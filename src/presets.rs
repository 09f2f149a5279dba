use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::{ArtifactBackendConfig, RuntimeConfig, SecretBackendConfig};
use crate::contract::{ContractEntrySpec, Environment};
use crate::definition::{CURRENT_VERSION, PipelineDefinition, StageSpec};
use crate::secrets::SecretBinding;
use crate::stage::CommandSpec;

pub const PRESETS: &[&str] = &["ml-training", "env-check"];

pub fn generate_preset(name: &str, destination: &Path) -> Result<PathBuf> {
    let preset = build_preset(name)?;
    let rendered = serde_yaml::to_string(&preset)?;
    if let Some(parent) = destination.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(destination, rendered)
        .with_context(|| format!("Failed to write preset pipeline: {}", destination.display()))?;

    Ok(destination.to_path_buf())
}

pub fn build_preset(name: &str) -> Result<PipelineDefinition> {
    match name {
        "ml-training" => Ok(ml_training_preset()),
        "env-check" => Ok(env_check_preset()),
        other => anyhow::bail!(
            "Unknown preset '{other}'. Available presets: {}",
            PRESETS.join(", ")
        ),
    }
}

/// dataprep -> train -> save, exchanging files through the local workdir.
fn ml_training_preset() -> PipelineDefinition {
    let mut prepdata = stage("prepdata", "python", &["preparedata.py"], "dataprep");
    prepdata.secrets.push(SecretBinding {
        key: "s3token".into(),
        inject_as: "STORAGE_S3_SECRET".into(),
    });
    prepdata.contract.extend([
        contract("STORAGE_S3_SECRET"),
        contract("S3_BUCKET=mybucket"),
    ]);
    prepdata.outputs.push("data/data.txt".into());

    let mut train = stage("train", "python", &["train.py"], "training");
    train.inputs.push("data/data.txt".into());
    train.outputs.push("models/model.txt".into());

    let mut save = stage("save", "python", &["save.py"], "save");
    save.inputs.push("models/model.txt".into());

    PipelineDefinition {
        version: CURRENT_VERSION,
        name: Some("ml-training".into()),
        runtime: RuntimeConfig {
            inherit_env: vec!["PATH".into(), "HOME".into()],
            secrets: SecretBackendConfig::Env { prefix: None },
            ..RuntimeConfig::default()
        },
        env: env(&[("S3_BUCKET", "mybucket")]),
        pipeline: vec![prepdata, train, save],
    }
}

/// Single stage that re-checks its own environment from inside the process.
fn env_check_preset() -> PipelineDefinition {
    let mut check = stage(
        "check-env",
        "stagecraft",
        &["check-env", "MODE=check", "SOME_VAR=someval"],
        "check",
    );
    check.env.insert("SOME_VAR".into(), "someval".into());
    check.contract.push(contract("SOME_VAR=someval"));

    PipelineDefinition {
        version: CURRENT_VERSION,
        name: Some("env-check".into()),
        runtime: RuntimeConfig {
            workers: 1,
            inherit_env: vec!["PATH".into()],
            artifacts: ArtifactBackendConfig::Memory,
            ..RuntimeConfig::default()
        },
        env: Environment::new(),
        pipeline: vec![check],
    }
}

fn stage(name: &str, program: &str, args: &[&str], mode: &str) -> StageSpec {
    StageSpec {
        name: name.into(),
        command: CommandSpec::new(program, args.iter().copied()),
        env: env(&[("MODE", mode)]),
        secrets: Vec::new(),
        contract: vec![contract(&format!("MODE={mode}"))],
        inputs: Vec::new(),
        outputs: Vec::new(),
        depends_on: Vec::new(),
    }
}

fn contract(entry: &str) -> ContractEntrySpec {
    ContractEntrySpec::Shorthand(entry.to_string())
}

fn env(pairs: &[(&str, &str)]) -> Environment {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}
