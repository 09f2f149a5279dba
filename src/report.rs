use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::artifacts::ArtifactRef;
use crate::stage::StageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StageStatus::Succeeded | StageStatus::Failed | StageStatus::Skipped
        )
    }

    /// Whether stages depending on this one must be skipped.
    pub fn blocks_dependents(self) -> bool {
        matches!(self, StageStatus::Failed | StageStatus::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Succeeded => "succeeded",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorDetail {
    pub kind: String,
    pub message: String,
}

impl From<&StageError> for ErrorDetail {
    fn from(err: &StageError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    pub stage: String,
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<ArtifactRef>,
}

impl StageResult {
    pub fn pending(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            status: StageStatus::Pending,
            error: None,
            started_at: None,
            finished_at: None,
            outputs: Vec::new(),
        }
    }

    pub(crate) fn start(&mut self, at: DateTime<Utc>) {
        debug_assert_eq!(self.status, StageStatus::Pending);
        self.status = StageStatus::Running;
        self.started_at = Some(at);
    }

    pub(crate) fn succeed(&mut self, at: DateTime<Utc>, outputs: Vec<ArtifactRef>) {
        debug_assert_eq!(self.status, StageStatus::Running);
        self.status = StageStatus::Succeeded;
        self.finished_at = Some(at);
        self.outputs = outputs;
    }

    pub(crate) fn fail(&mut self, at: DateTime<Utc>, error: ErrorDetail) {
        self.status = StageStatus::Failed;
        self.finished_at = Some(at);
        self.error = Some(error);
    }

    pub(crate) fn skip(&mut self, at: DateTime<Utc>, reason: impl Into<String>) {
        debug_assert_eq!(self.status, StageStatus::Pending);
        self.status = StageStatus::Skipped;
        self.finished_at = Some(at);
        self.error = Some(ErrorDetail {
            kind: "skipped".to_string(),
            message: reason.into(),
        });
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
}

/// Outcome of one pipeline execution, one entry per stage in declaration order.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub pipeline: String,
    pub status: RunStatus,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stages: Vec<StageResult>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn result(&self, stage: &str) -> Option<&StageResult> {
        self.stages.iter().find(|result| result.stage == stage)
    }

    pub fn count(&self, status: StageStatus) -> usize {
        self.stages
            .iter()
            .filter(|result| result.status == status)
            .count()
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create report directory: {}", parent.display())
            })?;
        }
        let file = File::create(path)
            .with_context(|| format!("Failed to create report file: {}", path.display()))?;
        serde_json::to_writer_pretty(file, self)
            .with_context(|| format!("Failed to write run report: {}", path.display()))?;
        Ok(())
    }
}
