pub mod artifacts;
pub mod config;
pub mod contract;
pub mod definition;
pub mod executor;
pub mod lockfile;
pub mod observability;
pub mod pipeline;
pub mod presets;
pub mod report;
pub mod secrets;
pub mod stage;
pub mod validation;

pub use artifacts::{ArtifactError, ArtifactRef, ArtifactStore};
pub use contract::{ContractViolation, Environment, EnvironmentContract};
pub use definition::PipelineDefinition;
pub use executor::{CancellationToken, PipelineExecutor, RunState};
pub use pipeline::{Pipeline, PipelineError};
pub use report::{RunReport, RunStatus, StageResult, StageStatus};
pub use stage::{Stage, StageError};
