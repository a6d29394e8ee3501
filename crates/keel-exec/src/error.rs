//! Error types for keel-exec

use std::sync::Arc;

use thiserror::Error;

use keel_core::{CredsError, PlanId};
use keel_state::StorageError;
use keel_worker::{ArtifactError, Volume, WorkerError};

/// Result type for step execution
pub type ExecResult<T> = std::result::Result<T, ExecError>;

/// Errors raised by a resource fetch.
#[derive(Error, Debug, Clone)]
pub enum FetchError {
    /// The `in` script exited non-zero. Not an infrastructure failure.
    #[error("resource script failed: exit status {exit_status}")]
    ScriptFailed {
        exit_status: i32,
        volume: Option<Arc<dyn Volume>>,
    },

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("interrupted")]
    Cancelled,
}

/// Errors raised while running a step tree.
///
/// Lower-layer errors are wrapped transparently so callers see the same
/// variant and payload the failing collaborator produced.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecError {
    #[error("pipeline '{pipeline_name}' not found")]
    PipelineNotFound { pipeline_name: String },

    #[error("resource '{resource_name}' not found")]
    ResourceNotFound { resource_name: String },

    #[error("no version to fetch for plan {plan_id}")]
    VersionMissing { plan_id: PlanId },

    #[error("resource script failed: exit status {exit_status}")]
    ScriptFailed { exit_status: i32 },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Creds(#[from] CredsError),

    #[error("{} steps errored: {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<ExecError>),

    #[error("interrupted")]
    Cancelled,
}

fn join_errors(errors: &[ExecError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ExecError {
    /// Cancellation reported by a lower layer, as [`ExecError::Cancelled`].
    pub fn or_cancelled(self) -> Self {
        match self {
            ExecError::Worker(WorkerError::Cancelled)
            | ExecError::Artifact(ArtifactError::Worker(WorkerError::Cancelled)) => {
                ExecError::Cancelled
            }
            other => other,
        }
    }
}

impl From<FetchError> for ExecError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::ScriptFailed { exit_status, .. } => ExecError::ScriptFailed { exit_status },
            FetchError::Worker(WorkerError::Cancelled) | FetchError::Cancelled => {
                ExecError::Cancelled
            }
            FetchError::Worker(e) => ExecError::Worker(e),
            FetchError::Storage(e) => ExecError::Storage(e),
        }
    }
}
