//! Streaming contracts for the bits a step produces.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::archive::{self, FileStream};
use crate::error::ArtifactError;
use crate::worker::{ByteStream, Volume};

/// Somewhere an artifact can be streamed into.
#[async_trait]
pub trait ArtifactDestination: Send + Sync {
    /// Unpack a tar+gzip stream under `path`.
    async fn stream_in(
        &self,
        cancel: &CancellationToken,
        path: &str,
        stream: ByteStream,
    ) -> Result<(), ArtifactError>;
}

/// A named, streamable handle to bits produced by a step.
#[async_trait]
pub trait ArtifactSource: Send + Sync + fmt::Debug {
    /// Stream the whole artifact into `destination`.
    async fn stream_to(
        &self,
        cancel: &CancellationToken,
        destination: &dyn ArtifactDestination,
    ) -> Result<(), ArtifactError>;

    /// Open a single file of the artifact.
    async fn stream_file(
        &self,
        cancel: &CancellationToken,
        path: &str,
    ) -> Result<FileStream, ArtifactError>;
}

/// Scan a tar+gzip stream for `path` off the async runtime.
pub async fn open_entry(stream: ByteStream, path: &str) -> Result<FileStream, ArtifactError> {
    let owned = path.to_string();
    tokio::task::spawn_blocking(move || archive::open_entry(stream, &owned))
        .await
        .map_err(|e| ArtifactError::Io(e.to_string()))?
}

/// Streams into a volume.
#[derive(Debug, Clone)]
pub struct VolumeDestination {
    volume: Arc<dyn Volume>,
}

impl VolumeDestination {
    pub fn new(volume: Arc<dyn Volume>) -> Self {
        Self { volume }
    }
}

#[async_trait]
impl ArtifactDestination for VolumeDestination {
    async fn stream_in(
        &self,
        cancel: &CancellationToken,
        path: &str,
        stream: ByteStream,
    ) -> Result<(), ArtifactError> {
        Ok(self.volume.stream_in(cancel, path, stream).await?)
    }
}

/// Unpacks into a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct DirectoryDestination {
    root: PathBuf,
}

impl DirectoryDestination {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ArtifactDestination for DirectoryDestination {
    async fn stream_in(
        &self,
        cancel: &CancellationToken,
        path: &str,
        stream: ByteStream,
    ) -> Result<(), ArtifactError> {
        if cancel.is_cancelled() {
            return Err(crate::error::WorkerError::Cancelled.into());
        }
        let dest = self.root.join(archive::normalize_entry_path(path));
        tokio::task::spawn_blocking(move || archive::unpack(stream, &dest))
            .await
            .map_err(|e| ArtifactError::Io(e.to_string()))??;
        Ok(())
    }
}
