//! Worker, container and volume contracts.
//!
//! A [`Worker`] hosts containers and volumes. The fetch path needs three
//! things from it: find an already-initialised cache volume, create (or
//! find) the container that runs the resource's `in` script, and mark a
//! freshly fetched volume as the cache volume for a `UsedResourceCache`.

use std::fmt;
use std::io::Read;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use keel_core::{Metadata, Params, Source, Space, Version, VersionedResourceTypes};
use keel_state::{ContainerMetadata, ContainerOwner, UsedResourceCache};

use crate::error::WorkerResult;
use crate::spec::{ContainerSpec, WorkerSpec};

/// A readable tar+gzip stream.
pub type ByteStream = Box<dyn Read + Send>;

/// Which pipe of a script a chunk of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Receives script output as it is produced.
pub trait ProcessOutput: Send + Sync {
    fn write(&self, stream: OutputStream, chunk: &str);
}

/// Discards all output.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullOutput;

impl ProcessOutput for NullOutput {
    fn write(&self, _stream: OutputStream, _chunk: &str) {}
}

/// Request written to the `in` script's stdin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetRequest {
    pub source: Source,
    pub params: Params,
    pub version: Version,
    pub space: Space,
}

/// What an `in` script reports on stdout when it succeeds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetResponse {
    #[serde(default)]
    pub version: Version,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Result of running an `in` script to completion.
#[derive(Debug, Clone)]
pub enum GetOutcome {
    Succeeded {
        volume: Arc<dyn Volume>,
        response: GetResponse,
    },
    /// Non-zero exit. The volume holds whatever the script left behind.
    Failed {
        exit_status: i32,
        volume: Option<Arc<dyn Volume>>,
    },
}

/// A unit of storage on a worker.
#[async_trait]
pub trait Volume: Send + Sync + fmt::Debug {
    fn handle(&self) -> &str;
    fn worker_name(&self) -> &str;

    /// Tar+gzip archive of `path` (relative to the volume root).
    async fn stream_out(&self, cancel: &CancellationToken, path: &str)
        -> WorkerResult<ByteStream>;

    /// Unpack a tar+gzip archive under `path`.
    async fn stream_in(
        &self,
        cancel: &CancellationToken,
        path: &str,
        stream: ByteStream,
    ) -> WorkerResult<()>;
}

/// A container on a worker.
#[async_trait]
pub trait Container: Send + Sync + fmt::Debug {
    fn handle(&self) -> &str;
    fn owner(&self) -> &ContainerOwner;

    /// Run the resource's `in` script into a fresh volume.
    ///
    /// Script output is forwarded to `output`. Cancellation kills the
    /// script and yields `WorkerError::Cancelled`.
    async fn run_get(
        &self,
        cancel: &CancellationToken,
        request: &GetRequest,
        output: Arc<dyn ProcessOutput>,
    ) -> WorkerResult<GetOutcome>;
}

/// A machine that runs containers.
#[async_trait]
pub trait Worker: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Owning team; `None` for a worker shared by every team.
    fn team_id(&self) -> Option<i32>;

    fn tags(&self) -> &[String];

    /// Base resource types this worker provides.
    fn resource_types(&self) -> &[String];

    fn active_containers(&self) -> usize;

    /// Free volume space in bytes.
    fn available_volume_space(&self) -> u64;

    /// Whether this worker may take work described by `spec`.
    fn satisfies(&self, spec: &WorkerSpec) -> bool {
        satisfies(
            self.team_id(),
            self.tags(),
            self.resource_types(),
            spec,
        )
    }

    async fn find_container_for_owner(
        &self,
        owner: &ContainerOwner,
    ) -> WorkerResult<Option<Arc<dyn Container>>>;

    async fn find_or_create_container(
        &self,
        cancel: &CancellationToken,
        owner: &ContainerOwner,
        metadata: &ContainerMetadata,
        spec: &ContainerSpec,
        resource_types: &VersionedResourceTypes,
    ) -> WorkerResult<Arc<dyn Container>>;

    /// Volume already holding the fetched bits of `cache`, if any.
    async fn find_volume_for_resource_cache(
        &self,
        cache: &UsedResourceCache,
    ) -> WorkerResult<Option<Arc<dyn Volume>>>;

    /// Mark `volume` as the cache volume for `cache`.
    async fn initialize_resource_cache(
        &self,
        volume: Arc<dyn Volume>,
        cache: &UsedResourceCache,
    ) -> WorkerResult<()>;
}

/// Team, resource type and tag compatibility of a worker with a spec.
///
/// - A team-owned worker only serves its own team.
/// - The spec's type is resolved through its custom resource types to a
///   base type, which the worker must provide.
/// - A tagged worker only takes tagged work, and every requested tag must be
///   one of the worker's.
pub fn satisfies(
    worker_team: Option<i32>,
    worker_tags: &[String],
    worker_types: &[String],
    spec: &WorkerSpec,
) -> bool {
    if let Some(team) = worker_team {
        if team != spec.team_id {
            return false;
        }
    }

    if !spec.resource_type.is_empty() {
        let base = spec.resource_types.base_type(&spec.resource_type);
        if !worker_types.iter().any(|t| t == base) {
            return false;
        }
    }

    if spec.tags.is_empty() {
        worker_tags.is_empty()
    } else {
        spec.tags.iter().all(|tag| worker_tags.contains(tag))
    }
}
