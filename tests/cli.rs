use std::fs;

use assert_cmd::Command;
use tempfile::tempdir;

fn stagecraft() -> Command {
    let mut command = Command::cargo_bin("stagecraft").expect("binary present");
    command.env_remove("RUST_LOG");
    command
}

#[test]
fn check_env_accepts_a_matching_environment() {
    let assert = stagecraft()
        .env("MODE", "training")
        .env("S3_BUCKET", "mybucket")
        .args(["check-env", "MODE=training", "S3_BUCKET"])
        .assert()
        .success();
    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    assert!(stdout.contains("ok: MODE"));
    assert!(stdout.contains("ok: S3_BUCKET"));
}

#[test]
fn check_env_rejects_mismatched_and_empty_values() {
    stagecraft()
        .env("MODE", "save")
        .args(["check-env", "MODE=training"])
        .assert()
        .failure();

    stagecraft()
        .env("SOME_VAR", "")
        .args(["check-env", "SOME_VAR"])
        .assert()
        .failure();
}

#[test]
fn new_preset_then_validate_and_lock() {
    let temp = tempdir().unwrap();
    let pipeline = temp.path().join("ml.yaml");
    let lock = temp.path().join("locks").join("ml.lock.yaml");

    stagecraft()
        .args(["new", "--preset", "ml-training", "--output"])
        .arg(&pipeline)
        .assert()
        .success();
    stagecraft().arg("validate").arg(&pipeline).assert().success();
    stagecraft()
        .arg("lock")
        .arg(&pipeline)
        .arg(&lock)
        .assert()
        .success();

    let content = fs::read_to_string(&lock).unwrap();
    assert!(content.contains("pipeline: ml-training"));
}

#[test]
fn validate_fails_on_a_cycle() {
    let temp = tempdir().unwrap();
    let pipeline = temp.path().join("cycle.yaml");
    fs::write(
        &pipeline,
        r#"
version: 1
pipeline:
  - name: a
    command: { program: "true" }
    depends_on: [b]
  - name: b
    command: { program: "true" }
    depends_on: [a]
"#,
    )
    .unwrap();

    stagecraft().arg("validate").arg(&pipeline).assert().failure();
    stagecraft().arg("lint").arg(&pipeline).assert().failure();
}

#[test]
fn plan_prints_stages_in_execution_order() {
    let temp = tempdir().unwrap();
    let pipeline = temp.path().join("plan.yaml");
    fs::write(
        &pipeline,
        r#"
version: 1
name: planned
pipeline:
  - name: save
    command: { program: "true" }
    inputs: [model.txt]
  - name: train
    command: { program: "true" }
    outputs: [model.txt]
"#,
    )
    .unwrap();

    let assert = stagecraft().arg("plan").arg(&pipeline).assert().success();
    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    let train = stdout.find("train").expect("train listed");
    let save = stdout.find("save (after train)").expect("save listed");
    assert!(train < save, "{stdout}");
}

#[test]
fn artifact_put_then_get_round_trips_through_the_store() {
    let temp = tempdir().unwrap();
    let pipeline = temp.path().join("store.yaml");
    fs::write(
        &pipeline,
        r#"
version: 1
runtime:
  artifacts: { backend: local, root: store }
pipeline:
  - name: noop
    command: { program: "true" }
"#,
    )
    .unwrap();
    let source = temp.path().join("model.bin");
    fs::write(&source, "mymodel").unwrap();
    let fetched = temp.path().join("fetched.bin");

    stagecraft()
        .args(["artifact", "put", "models/model.txt"])
        .arg(&source)
        .arg("--pipeline")
        .arg(&pipeline)
        .assert()
        .success();
    assert!(temp.path().join("store/models/model.txt").is_file());

    stagecraft()
        .args(["artifact", "get", "models/model.txt", "--pipeline"])
        .arg(&pipeline)
        .arg("--output")
        .arg(&fetched)
        .assert()
        .success();
    assert_eq!(fs::read_to_string(&fetched).unwrap(), "mymodel");

    stagecraft()
        .args(["artifact", "get", "nonexistent", "--pipeline"])
        .arg(&pipeline)
        .assert()
        .failure();
}

#[test]
fn artifact_commands_refuse_the_memory_backend() {
    let temp = tempdir().unwrap();
    let pipeline = temp.path().join("memory.yaml");
    fs::write(
        &pipeline,
        r#"
version: 1
runtime:
  artifacts: { backend: memory }
pipeline:
  - name: noop
    command: { program: "true" }
"#,
    )
    .unwrap();
    let source = temp.path().join("model.bin");
    fs::write(&source, "mymodel").unwrap();

    let assert = stagecraft()
        .args(["artifact", "put", "models/model.txt"])
        .arg(&source)
        .arg("--pipeline")
        .arg(&pipeline)
        .assert()
        .failure();
    let stderr = String::from_utf8_lossy(&assert.get_output().stderr).to_string();
    assert!(stderr.contains("memory artifact backend"), "{stderr}");
}

#[test]
fn completions_are_generated() {
    let assert = stagecraft().args(["completions", "bash"]).assert().success();
    assert!(!assert.get_output().stdout.is_empty());
}

#[cfg(unix)]
mod run {
    use super::*;

    const CHAIN: &str = r#"
version: 1
name: chain
runtime:
  workers: 2
  inherit_env: [PATH]
env:
  S3_BUCKET: mybucket
pipeline:
  - name: dataprep
    command:
      program: sh
      args: ["-c", "mkdir -p data && printf mydata > data/data.txt"]
    env: { MODE: dataprep }
    contract: [MODE=dataprep, S3_BUCKET=mybucket]
    outputs: [data/data.txt]
  - name: train
    command:
      program: sh
      args: ["-c", "mkdir -p models && cp data/data.txt models/model.txt"]
    env: { MODE: training }
    contract: [MODE=training]
    inputs: [data/data.txt]
    outputs: [models/model.txt]
"#;

    fn report_statuses(path: &std::path::Path) -> Vec<(String, String)> {
        let report: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        report["stages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|stage| {
                (
                    stage["stage"].as_str().unwrap().to_string(),
                    stage["status"].as_str().unwrap().to_string(),
                )
            })
            .collect()
    }

    #[test]
    fn run_executes_the_chain_and_writes_a_report() {
        let temp = tempdir().unwrap();
        let pipeline = temp.path().join("chain.yaml");
        fs::write(&pipeline, CHAIN).unwrap();
        let report = temp.path().join("out").join("report.json");
        let metrics = temp.path().join("out").join("metrics.json");

        stagecraft()
            .arg("run")
            .arg(&pipeline)
            .arg("--report")
            .arg(&report)
            .arg("--metrics-json")
            .arg(&metrics)
            .assert()
            .success();

        assert_eq!(
            fs::read_to_string(temp.path().join("models/model.txt")).unwrap(),
            "mydata"
        );
        assert_eq!(
            report_statuses(&report),
            [
                ("dataprep".to_string(), "succeeded".to_string()),
                ("train".to_string(), "succeeded".to_string()),
            ]
        );
        assert!(metrics.is_file());
    }

    #[test]
    fn failing_stage_fails_the_run_and_skips_dependents() {
        let temp = tempdir().unwrap();
        let pipeline = temp.path().join("chain.yaml");
        fs::write(
            &pipeline,
            CHAIN.replace("mkdir -p data && printf mydata > data/data.txt", "exit 4"),
        )
        .unwrap();
        let report = temp.path().join("report.json");

        stagecraft()
            .arg("run")
            .arg(&pipeline)
            .arg("--report")
            .arg(&report)
            .assert()
            .failure();

        assert_eq!(
            report_statuses(&report),
            [
                ("dataprep".to_string(), "failed".to_string()),
                ("train".to_string(), "skipped".to_string()),
            ]
        );
        assert!(!temp.path().join("data/data.txt").exists());
    }

    #[test]
    fn dry_run_executes_nothing() {
        let temp = tempdir().unwrap();
        let pipeline = temp.path().join("chain.yaml");
        fs::write(&pipeline, CHAIN).unwrap();

        stagecraft()
            .arg("run")
            .arg(&pipeline)
            .arg("--dry-run")
            .assert()
            .success();
        assert!(!temp.path().join("data").exists());
    }
}
