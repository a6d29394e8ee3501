//! Storage trait definitions for keel
//!
//! These traits define the collaborators the step engine reads from:
//! - `Build` / `Pipeline` / `Resource`: the pipeline store
//! - `ResourceCacheFactory`: content-addressed records of fetched versions
//! - `LockFactory`: named, cluster-wide fetch locks
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module; `lock::InProcessLockFactory` is a
//! real single-process lock factory.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use keel_core::{Metadata, Params, PlanId, Source, Space, Version, VersionedResourceTypes};

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Containers
// ---------------------------------------------------------------------------

/// Ties a container to one step invocation of one build.
///
/// The same owner always maps to the same container, so retries and
/// `intercept` sessions land in the container the step already used.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerOwner {
    pub build_id: i64,
    pub plan_id: PlanId,
    pub team_id: i32,
}

impl ContainerOwner {
    pub fn build_step(build_id: i64, plan_id: PlanId, team_id: i32) -> Self {
        Self {
            build_id,
            plan_id,
            team_id,
        }
    }
}

impl fmt::Display for ContainerOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "build:{}/plan:{}/team:{}",
            self.build_id, self.plan_id, self.team_id
        )
    }
}

/// Kind of step a container was created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerType {
    Check,
    Get,
    Put,
    Task,
}

/// Descriptive metadata recorded with a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerMetadata {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub container_type: Option<ContainerType>,
    pub step_name: String,
    pub attempt: String,
    pub working_directory: String,
    pub user: String,
    pub pipeline_id: i64,
    pub job_id: i64,
    pub build_id: i64,
    pub pipeline_name: String,
    pub job_name: String,
    pub build_name: String,
}

// ---------------------------------------------------------------------------
// Pipeline store
// ---------------------------------------------------------------------------

/// A build of a job (or a one-off build) as seen by its steps.
#[async_trait]
pub trait Build: Send + Sync {
    fn id(&self) -> i64;
    fn name(&self) -> &str;
    fn team_id(&self) -> i32;
    fn team_name(&self) -> &str;
    /// Empty for one-off builds.
    fn pipeline_name(&self) -> &str;

    /// The pipeline the build belongs to, if it still exists.
    async fn pipeline(&self) -> StorageResult<Option<Arc<dyn Pipeline>>>;
}

/// A configured pipeline.
#[async_trait]
pub trait Pipeline: Send + Sync {
    fn id(&self) -> i64;
    fn name(&self) -> &str;

    /// Look up a resource by its pipeline-level name.
    async fn resource(&self, name: &str) -> StorageResult<Option<Arc<dyn Resource>>>;
}

/// A pipeline resource and its version history.
#[async_trait]
pub trait Resource: Send + Sync {
    fn id(&self) -> i64;
    fn name(&self) -> &str;
    fn resource_type(&self) -> &str;

    /// Metadata saved for a version, if the version is known.
    async fn get_metadata(
        &self,
        space: &Space,
        version: &Version,
    ) -> StorageResult<Option<Metadata>>;
}

// ---------------------------------------------------------------------------
// Resource caches
// ---------------------------------------------------------------------------

/// The broad content address of a resource: its type and source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub id: i64,
    /// Type as named by the plan (may be a custom type).
    pub resource_type: String,
    /// Base type the custom-type chain resolves to.
    pub base_resource_type: String,
    /// Digest over the source and the versions of the custom-type chain.
    pub source_hash: String,
}

/// A resource config narrowed to one version and one set of params.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsedResourceCache {
    pub id: i64,
    pub resource_config: ResourceConfig,
    pub version: Version,
    pub params_hash: String,
    pub created_at: DateTime<Utc>,
}

impl UsedResourceCache {
    pub fn resource_config(&self) -> &ResourceConfig {
        &self.resource_config
    }
}

/// Who keeps a resource cache alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceCacheUser {
    ForBuild(i64),
    ForContainer(i64),
}

/// Store of resource cache records.
///
/// Guarantees:
/// - the same (type, version, source, params, resource types) always yields
///   the same cache id;
/// - every call records `user` as a user of the returned cache.
#[async_trait]
pub trait ResourceCacheFactory: Send + Sync {
    async fn find_or_create_resource_cache(
        &self,
        user: ResourceCacheUser,
        resource_type: &str,
        version: &Version,
        source: &Source,
        params: &Params,
        resource_types: &VersionedResourceTypes,
    ) -> StorageResult<UsedResourceCache>;
}

// ---------------------------------------------------------------------------
// Locks
// ---------------------------------------------------------------------------

/// Name of a cluster-wide lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockId(String);

impl LockId {
    /// Lock guarding the fetch of one resource signature on one worker.
    pub fn resource_fetch(lock_name: &str) -> Self {
        LockId(format!("resource-fetch:{lock_name}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A held lock. Dropping it without calling `release` also releases it.
pub trait Lock: Send + Sync {
    fn id(&self) -> &LockId;
    fn release(self: Box<Self>) -> StorageResult<()>;
}

/// Non-blocking lock acquisition.
///
/// `acquire` returns `Ok(None)` when another holder has the lock; callers
/// decide how to wait.
#[async_trait]
pub trait LockFactory: Send + Sync {
    async fn acquire(&self, id: &LockId) -> StorageResult<Option<Box<dyn Lock>>>;
}
