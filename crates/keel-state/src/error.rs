//! Error types for keel-state

use thiserror::Error;

/// Errors raised by the pipeline store, the resource cache store and the
/// lock factory.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The backing store failed
    #[error("storage backend failed: {0}")]
    Backend(String),

    /// A record could not be encoded
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// A lock was released twice or never acquired
    #[error("lock {lock} is not held")]
    LockNotHeld { lock: String },
}

impl From<keel_core::CoreError> for StorageError {
    fn from(err: keel_core::CoreError) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
