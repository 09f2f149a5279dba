use std::path::Path;

use stagecraft::definition::PipelineDefinition;
use stagecraft::validation::validate_definition;

#[test]
fn quickstart_pipeline_is_valid() {
    let definition = PipelineDefinition::load(Path::new("pipelines/quickstart.yaml"))
        .expect("quickstart pipeline should load");
    let report = validate_definition(&definition);
    assert!(
        report.is_ok(),
        "quickstart pipeline should pass validation: {:?}",
        report.errors
    );
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);
}
