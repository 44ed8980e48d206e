use std::time::Duration;
use thiserror::Error;

use crate::core::job::PipelineStage;
use crate::services::task::TaskKind;

/// Errors surfaced by the pipeline coordinator and its collaborators.
///
/// `Validation` and `DuplicateId` are caller mistakes; the rest originate
/// from external services, the job store, or malformed model output.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("job '{0}' already exists")]
    DuplicateId(String),

    #[error("job '{0}' not found")]
    NotFound(String),

    #[error("task submission failed: {0}")]
    Submission(String),

    #[error("{kind} task {task_id} timed out after {waited:?}")]
    Timeout {
        kind: TaskKind,
        task_id: String,
        waited: Duration,
    },

    #[error("{kind} task {task_id} errored: {reason}")]
    TaskErrored {
        kind: TaskKind,
        task_id: String,
        reason: String,
    },

    #[error("unexpected response shape: {0}")]
    DataShape(String),

    #[error("job store error: {0}")]
    Store(String),

    #[error("stage '{stage}' failed: {message}")]
    StageFailed {
        stage: PipelineStage,
        message: String,
    },
}

impl PipelineError {
    pub fn store(err: impl std::fmt::Display) -> Self {
        Self::Store(err.to_string())
    }

    pub fn in_stage(self, stage: PipelineStage) -> Self {
        match self {
            Self::StageFailed { .. } => self,
            other => Self::StageFailed {
                stage,
                message: other.to_string(),
            },
        }
    }

    /// Whether the error was caused by the caller rather than the system.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::DuplicateId(_))
    }
}
