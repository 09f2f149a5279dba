use std::fs;

use stagecraft::definition::PipelineDefinition;
use stagecraft::lockfile::{build_lock, generate_lock, hash_stage};
use stagecraft::pipeline::{Pipeline, PipelineError};
use stagecraft::validation::validate_definition;
use tempfile::tempdir;

const TRAINING: &str = r#"
version: 1
name: training
runtime:
  inherit_env: [PATH]
env:
  S3_BUCKET: mybucket
pipeline:
  - name: prepdata
    command: { program: python, args: [preparedata.py] }
    env: { MODE: dataprep }
    secrets:
      - { key: s3token, inject_as: STORAGE_S3_SECRET }
    contract: [MODE=dataprep, STORAGE_S3_SECRET, S3_BUCKET=mybucket]
    outputs: [data/data.txt]
  - name: train
    command: { program: python, args: [train.py] }
    env: { MODE: training }
    contract: [MODE=training]
    inputs: [data/data.txt]
    outputs: [models/model.txt]
  - name: save
    command: { program: python, args: [save.py] }
    env: { MODE: save }
    contract: [MODE=save]
    inputs: [models/model.txt]
"#;

fn parse(yaml: &str) -> PipelineDefinition {
    PipelineDefinition::parse(yaml).expect("definition parses")
}

#[test]
fn well_formed_definition_passes_without_warnings() {
    let report = validate_definition(&parse(TRAINING));
    assert!(report.is_ok(), "{:?}", report.errors);
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);
}

#[test]
fn execution_order_follows_artifact_edges() {
    let pipeline = Pipeline::from_definition(&parse(TRAINING)).unwrap();
    let order: Vec<_> = pipeline
        .order()
        .iter()
        .map(|&idx| pipeline.stage(idx).name.as_str())
        .collect();
    assert_eq!(order, ["prepdata", "train", "save"]);
    assert_eq!(pipeline.dependencies(2), [1]);
}

#[test]
fn cycle_is_reported_with_its_path() {
    let yaml = r#"
version: 1
pipeline:
  - name: a
    command: { program: "true" }
    depends_on: [c]
  - name: b
    command: { program: "true" }
    depends_on: [a]
  - name: c
    command: { program: "true" }
    depends_on: [b]
"#;
    let err = Pipeline::from_definition(&parse(yaml)).unwrap_err();
    let PipelineError::CyclicDependency { stages } = &err else {
        panic!("expected a cycle, got {err}");
    };
    assert_eq!(stages.first(), stages.last());
    assert_eq!(stages.len(), 4);

    let report = validate_definition(&parse(yaml));
    assert!(!report.is_ok());
    assert!(report.errors.iter().any(|e| e.contains("cyclic")));
}

#[test]
fn collects_errors_from_every_stage() {
    let yaml = r#"
version: 1
pipeline:
  - name: first
    command: { program: "" }
  - name: second
    command: { program: "true" }
    contract: [MODE=a, MODE=b]
  - name: third
    command: { program: "true" }
    outputs: [../escape.txt]
"#;
    let report = validate_definition(&parse(yaml));
    assert_eq!(report.errors.len(), 3, "{:?}", report.errors);
    assert!(report.errors[0].contains("empty command"));
    assert!(report.errors[1].contains("'MODE'"));
    assert!(report.errors[2].contains("../escape.txt"));
}

#[test]
fn graph_errors_are_reported() {
    let unknown = r#"
version: 1
pipeline:
  - name: train
    command: { program: "true" }
    depends_on: [prepdata]
"#;
    let report = validate_definition(&parse(unknown));
    assert!(report.errors.iter().any(|e| e.contains("unknown stage 'prepdata'")));

    let producers = r#"
version: 1
pipeline:
  - name: a
    command: { program: "true" }
    outputs: [model.txt]
  - name: b
    command: { program: "true" }
    outputs: [model.txt]
"#;
    let report = validate_definition(&parse(producers));
    assert!(report.errors.iter().any(|e| e.contains("produced by both")));
}

#[test]
fn unsupplied_contract_keys_and_external_inputs_are_warnings() {
    let yaml = r#"
version: 1
pipeline:
  - name: train
    command: { program: python, args: [train.py] }
    contract: [HOME]
    inputs: [data/raw.csv]
"#;
    let report = validate_definition(&parse(yaml));
    assert!(report.is_ok(), "{:?}", report.errors);
    assert_eq!(report.warnings.len(), 2, "{:?}", report.warnings);
    assert!(report.warnings.iter().any(|w| w.contains("'HOME'")));
    assert!(report.warnings.iter().any(|w| w.contains("data/raw.csv")));
}

#[test]
fn memory_backend_with_declared_outputs_is_a_warning() {
    let yaml = r#"
version: 1
runtime:
  artifacts: { backend: memory }
pipeline:
  - name: check
    command: { program: "true" }
  - name: train
    command: { program: python, args: [train.py] }
    outputs: [models/model.txt]
"#;
    let report = validate_definition(&parse(yaml));
    assert!(report.is_ok(), "{:?}", report.errors);
    assert_eq!(report.warnings.len(), 1, "{:?}", report.warnings);
    assert!(report.warnings[0].contains("'train'"));
    assert!(report.warnings[0].contains("memory artifact backend"));

    let local = validate_definition(&parse(&yaml.replace("backend: memory", "backend: local")));
    assert!(local.warnings.is_empty(), "{:?}", local.warnings);
}

#[test]
fn configured_env_contradicting_contract_is_an_error() {
    let yaml = r#"
version: 1
env: { MODE: save }
pipeline:
  - name: train
    command: { program: python }
    contract: [MODE=training]
"#;
    let report = validate_definition(&parse(yaml));
    assert!(!report.is_ok());
    assert!(report.errors[0].contains("expects 'training'"));
}

#[test]
fn unsupported_version_and_bad_runtime_are_errors() {
    let yaml = r#"
version: 7
runtime:
  workers: 0
pipeline:
  - name: a
    command: { program: "true" }
"#;
    let report = validate_definition(&parse(yaml));
    assert!(report.errors.iter().any(|e| e.contains("version")));
    assert!(report.errors.iter().any(|e| e.contains("workers")));
}

#[test]
fn unknown_runtime_keys_are_rejected_at_parse_time() {
    let yaml = r#"
version: 1
runtime:
  wrokers: 4
pipeline:
  - name: a
    command: { program: "true" }
"#;
    assert!(PipelineDefinition::parse(yaml).is_err());
}

#[test]
fn lockfile_records_order_and_stage_hashes() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("training.lock.yaml");
    let definition = parse(TRAINING);
    generate_lock(&definition, &path).unwrap();

    let content = fs::read_to_string(&path).unwrap();
    assert!(content.contains("pipeline: training"));
    assert!(content.contains("execution_order:"));
    assert!(content.contains("definition_hash:"));
    assert!(content.contains("command: python train.py"));

    let lock = build_lock(&definition).unwrap();
    assert_eq!(lock.execution_order, ["prepdata", "train", "save"]);
    assert_eq!(lock.stages[1].definition_hash, hash_stage(&definition.pipeline[1]).unwrap());
}

#[test]
fn stage_hash_changes_with_its_definition() {
    let definition = parse(TRAINING);
    let original = hash_stage(&definition.pipeline[1]).unwrap();

    let mut changed = definition.pipeline[1].clone();
    changed.env.insert("EPOCHS".into(), "3".into());
    assert_ne!(hash_stage(&changed).unwrap(), original);
    assert_eq!(hash_stage(&definition.pipeline[1]).unwrap(), original);
}
