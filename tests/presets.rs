use std::fs;

use stagecraft::definition::PipelineDefinition;
use stagecraft::pipeline::Pipeline;
use stagecraft::presets::{PRESETS, build_preset, generate_preset};
use stagecraft::validation::validate_definition;
use tempfile::tempdir;

#[test]
fn ml_training_preset_writes_a_valid_pipeline() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("nested").join("ml.yaml");
    let generated = generate_preset("ml-training", &path).expect("preset generation");
    assert!(generated.exists());

    let contents = fs::read_to_string(&generated).unwrap();
    assert!(contents.contains("inject_as: STORAGE_S3_SECRET"));
    assert!(contents.contains("MODE=training"));

    let definition = PipelineDefinition::load(&generated).unwrap();
    let report = validate_definition(&definition);
    assert!(report.is_ok(), "{:?}", report.errors);
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);

    let pipeline = Pipeline::from_definition(&definition).unwrap();
    let order: Vec<_> = pipeline
        .order()
        .iter()
        .map(|&idx| pipeline.stage(idx).name.as_str())
        .collect();
    assert_eq!(order, ["prepdata", "train", "save"]);
}

#[test]
fn every_listed_preset_validates() {
    for name in PRESETS {
        let definition = build_preset(name).unwrap();
        let report = validate_definition(&definition);
        assert!(report.is_ok(), "{name}: {:?}", report.errors);
    }
}

#[test]
fn unknown_preset_lists_the_available_ones() {
    let err = build_preset("video").unwrap_err().to_string();
    assert!(err.contains("ml-training"));
    assert!(err.contains("env-check"));
}
