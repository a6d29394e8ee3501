//! Error types for keel-worker

use keel_state::StorageError;
use thiserror::Error;

/// Result type for worker operations
pub type WorkerResult<T> = std::result::Result<T, WorkerError>;

/// Errors raised while placing work on a worker or driving its containers
/// and volumes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    #[error("no workers")]
    NoWorkers,

    #[error(
        "no workers satisfying: resource type '{resource_type}', tags [{}], team {team_id}",
        tags.join(", ")
    )]
    NoCompatibleWorkers {
        resource_type: String,
        tags: Vec<String>,
        team_id: i32,
    },

    #[error("container for {owner} could not be created: {reason}")]
    ContainerCreation { owner: String, reason: String },

    #[error("volume {handle}: {reason}")]
    Volume { handle: String, reason: String },

    #[error("streaming {path} failed: {reason}")]
    Stream { path: String, reason: String },

    #[error("resource script failed to run: {0}")]
    Process(String),

    #[error("placement strategy: {0}")]
    Strategy(String),

    #[error("interrupted")]
    Cancelled,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors raised while reading an artifact.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArtifactError {
    #[error("file not found: {path}")]
    FileNotFound { path: String },

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("artifact i/o: {0}")]
    Io(String),
}

impl From<std::io::Error> for ArtifactError {
    fn from(err: std::io::Error) -> Self {
        ArtifactError::Io(err.to_string())
    }
}
