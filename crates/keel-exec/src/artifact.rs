//! Per-build registry of named artifacts.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use keel_worker::archive::normalize_entry_path;
use keel_worker::{ArtifactDestination, ArtifactError, ArtifactSource, ByteStream};

/// Name a step's output is registered under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactName(pub String);

impl ArtifactName {
    pub fn new(name: impl Into<String>) -> Self {
        ArtifactName(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ArtifactName {
    fn from(s: &str) -> Self {
        ArtifactName(s.to_string())
    }
}

/// Artifacts produced so far by one build.
///
/// Registering a name twice replaces the earlier source.
#[derive(Default)]
pub struct ArtifactRepository {
    sources: Mutex<BTreeMap<ArtifactName, Arc<dyn ArtifactSource>>>,
}

impl ArtifactRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn sources(&self) -> MutexGuard<'_, BTreeMap<ArtifactName, Arc<dyn ArtifactSource>>> {
        self.sources.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `source` under `name`, returning the source it replaced.
    pub fn register_source(
        &self,
        name: ArtifactName,
        source: Arc<dyn ArtifactSource>,
    ) -> Option<Arc<dyn ArtifactSource>> {
        self.sources().insert(name, source)
    }

    pub fn source_for(&self, name: &ArtifactName) -> Option<Arc<dyn ArtifactSource>> {
        self.sources().get(name).cloned()
    }

    /// Snapshot of every registered artifact.
    pub fn as_map(&self) -> BTreeMap<ArtifactName, Arc<dyn ArtifactSource>> {
        self.sources().clone()
    }

    pub fn len(&self) -> usize {
        self.sources().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources().is_empty()
    }

    /// Stream every artifact into `destination`, each under a directory
    /// named after it.
    pub async fn stream_to(
        &self,
        cancel: &CancellationToken,
        destination: &dyn ArtifactDestination,
    ) -> Result<(), ArtifactError> {
        for (name, source) in self.as_map() {
            let subdir = SubdirectoryDestination {
                inner: destination,
                prefix: name.as_str(),
            };
            source.stream_to(cancel, &subdir).await?;
        }
        Ok(())
    }
}

impl fmt::Debug for ArtifactRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.as_map()).finish()
    }
}

/// Redirects every stream into `prefix/<path>` of the wrapped destination.
struct SubdirectoryDestination<'a> {
    inner: &'a dyn ArtifactDestination,
    prefix: &'a str,
}

#[async_trait]
impl ArtifactDestination for SubdirectoryDestination<'_> {
    async fn stream_in(
        &self,
        cancel: &CancellationToken,
        path: &str,
        stream: ByteStream,
    ) -> Result<(), ArtifactError> {
        let path = normalize_entry_path(path);
        let joined = if path.is_empty() {
            self.prefix.to_string()
        } else {
            format!("{}/{}", self.prefix, path)
        };
        self.inner.stream_in(cancel, &joined, stream).await
    }
}
