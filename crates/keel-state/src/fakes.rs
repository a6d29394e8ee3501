//! In-memory fakes for storage traits (testing and local runs)
//!
//! Provides `MemoryBuild`, `MemoryPipeline`, `MemoryResource` and
//! `MemoryResourceCacheFactory`. Each fake counts the calls made to it and
//! can be told to fail, so callers can assert on how the store was used.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use keel_core::{
    compute_digest, Metadata, Params, Source, Space, Version, VersionedResourceTypes,
};

use crate::error::StorageError;
use crate::storage_traits::*;

/// Programmed answer of a lookup.
enum Lookup<T> {
    Found(T),
    Missing,
    Fail(StorageError),
}

impl<T: Clone> Lookup<T> {
    fn answer(&self) -> StorageResult<Option<T>> {
        match self {
            Lookup::Found(v) => Ok(Some(v.clone())),
            Lookup::Missing => Ok(None),
            Lookup::Fail(e) => Err(e.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryBuild
// ---------------------------------------------------------------------------

/// A build whose pipeline lookup is programmable.
pub struct MemoryBuild {
    id: i64,
    name: String,
    team_id: i32,
    team_name: String,
    pipeline_name: String,
    pipeline: Mutex<Lookup<Arc<dyn Pipeline>>>,
    pipeline_calls: AtomicUsize,
}

impl MemoryBuild {
    /// A build whose pipeline does not exist until `with_pipeline` is called.
    pub fn new(id: i64, team_id: i32, pipeline_name: impl Into<String>) -> Self {
        Self {
            id,
            name: id.to_string(),
            team_id,
            team_name: "main".to_string(),
            pipeline_name: pipeline_name.into(),
            pipeline: Mutex::new(Lookup::Missing),
            pipeline_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_team_name(mut self, team_name: impl Into<String>) -> Self {
        self.team_name = team_name.into();
        self
    }

    pub fn with_pipeline(self, pipeline: Arc<dyn Pipeline>) -> Self {
        *self.pipeline.lock().unwrap() = Lookup::Found(pipeline);
        self
    }

    /// Make every pipeline lookup fail with `err`.
    pub fn failing_pipeline_lookup(self, err: StorageError) -> Self {
        *self.pipeline.lock().unwrap() = Lookup::Fail(err);
        self
    }

    pub fn pipeline_call_count(&self) -> usize {
        self.pipeline_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Build for MemoryBuild {
    fn id(&self) -> i64 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn team_id(&self) -> i32 {
        self.team_id
    }

    fn team_name(&self) -> &str {
        &self.team_name
    }

    fn pipeline_name(&self) -> &str {
        &self.pipeline_name
    }

    async fn pipeline(&self) -> StorageResult<Option<Arc<dyn Pipeline>>> {
        self.pipeline_calls.fetch_add(1, Ordering::SeqCst);
        self.pipeline.lock().unwrap().answer()
    }
}

// ---------------------------------------------------------------------------
// MemoryPipeline
// ---------------------------------------------------------------------------

/// A pipeline holding a fixed set of resources.
pub struct MemoryPipeline {
    id: i64,
    name: String,
    resources: Mutex<HashMap<String, Arc<dyn Resource>>>,
    failure: Mutex<Option<StorageError>>,
    resource_calls: AtomicUsize,
}

impl MemoryPipeline {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            resources: Mutex::new(HashMap::new()),
            failure: Mutex::new(None),
            resource_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_resource(self, resource: Arc<dyn Resource>) -> Self {
        self.resources
            .lock()
            .unwrap()
            .insert(resource.name().to_string(), resource);
        self
    }

    /// Make every resource lookup fail with `err`.
    pub fn failing_resource_lookup(self, err: StorageError) -> Self {
        *self.failure.lock().unwrap() = Some(err);
        self
    }

    pub fn resource_call_count(&self) -> usize {
        self.resource_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Pipeline for MemoryPipeline {
    fn id(&self) -> i64 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn resource(&self, name: &str) -> StorageResult<Option<Arc<dyn Resource>>> {
        self.resource_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failure.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(self.resources.lock().unwrap().get(name).cloned())
    }
}

// ---------------------------------------------------------------------------
// MemoryResource
// ---------------------------------------------------------------------------

/// A resource with saved version metadata.
pub struct MemoryResource {
    id: i64,
    name: String,
    resource_type: String,
    metadata: Mutex<HashMap<String, Metadata>>,
    failure: Mutex<Option<StorageError>>,
    metadata_calls: Mutex<Vec<(Space, Version)>>,
}

impl MemoryResource {
    pub fn new(id: i64, name: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            resource_type: resource_type.into(),
            metadata: Mutex::new(HashMap::new()),
            failure: Mutex::new(None),
            metadata_calls: Mutex::new(Vec::new()),
        }
    }

    /// Save metadata for a version.
    pub fn with_version(self, space: Space, version: Version, metadata: Metadata) -> Self {
        self.metadata
            .lock()
            .unwrap()
            .insert(version_key(&space, &version), metadata);
        self
    }

    /// Make every metadata lookup fail with `err`.
    pub fn failing_metadata_lookup(self, err: StorageError) -> Self {
        *self.failure.lock().unwrap() = Some(err);
        self
    }

    /// Arguments of every `get_metadata` call, in order.
    pub fn metadata_calls(&self) -> Vec<(Space, Version)> {
        self.metadata_calls.lock().unwrap().clone()
    }
}

fn version_key(space: &Space, version: &Version) -> String {
    json!({"space": space, "version": version}).to_string()
}

#[async_trait]
impl Resource for MemoryResource {
    fn id(&self) -> i64 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn resource_type(&self) -> &str {
        &self.resource_type
    }

    async fn get_metadata(
        &self,
        space: &Space,
        version: &Version,
    ) -> StorageResult<Option<Metadata>> {
        self.metadata_calls
            .lock()
            .unwrap()
            .push((space.clone(), version.clone()));
        if let Some(err) = self.failure.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(self
            .metadata
            .lock()
            .unwrap()
            .get(&version_key(space, version))
            .cloned())
    }
}

// ---------------------------------------------------------------------------
// MemoryResourceCacheFactory
// ---------------------------------------------------------------------------

/// Arguments of one `find_or_create_resource_cache` call.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceCacheRequest {
    pub user: ResourceCacheUser,
    pub resource_type: String,
    pub version: Version,
    pub source: Source,
    pub params: Params,
    pub resource_types: VersionedResourceTypes,
}

#[derive(Default)]
struct CacheTables {
    configs: HashMap<String, ResourceConfig>,
    caches: HashMap<(i64, String, String), UsedResourceCache>,
    users: HashMap<i64, Vec<ResourceCacheUser>>,
}

/// Resource cache store keyed by content digests.
#[derive(Default)]
pub struct MemoryResourceCacheFactory {
    tables: Mutex<CacheTables>,
    next_id: AtomicI64,
    failure: Mutex<Option<StorageError>>,
    requests: Mutex<Vec<ResourceCacheRequest>>,
}

impl MemoryResourceCacheFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `err`.
    pub fn failing_with(self, err: StorageError) -> Self {
        *self.failure.lock().unwrap() = Some(err);
        self
    }

    /// Arguments of every call, in order.
    pub fn requests(&self) -> Vec<ResourceCacheRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Users recorded for a cache id.
    pub fn users_of(&self, cache_id: i64) -> Vec<ResourceCacheUser> {
        self.tables
            .lock()
            .unwrap()
            .users
            .get(&cache_id)
            .cloned()
            .unwrap_or_default()
    }

    fn allocate_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl ResourceCacheFactory for MemoryResourceCacheFactory {
    async fn find_or_create_resource_cache(
        &self,
        user: ResourceCacheUser,
        resource_type: &str,
        version: &Version,
        source: &Source,
        params: &Params,
        resource_types: &VersionedResourceTypes,
    ) -> StorageResult<UsedResourceCache> {
        self.requests.lock().unwrap().push(ResourceCacheRequest {
            user,
            resource_type: resource_type.to_string(),
            version: version.clone(),
            source: source.clone(),
            params: params.clone(),
            resource_types: resource_types.clone(),
        });
        if let Some(err) = self.failure.lock().unwrap().clone() {
            return Err(err);
        }

        let type_chain: Vec<_> = custom_type_chain(resource_type, resource_types);
        let source_hash = compute_digest(&json!({
            "type": resource_type,
            "source": source,
            "type_versions": type_chain,
        }))?;
        let params_hash = compute_digest(&serde_json::to_value(params)?)?;
        let version_key = serde_json::to_string(version)?;

        let mut tables = self.tables.lock().unwrap();
        let config = match tables.configs.get(&source_hash) {
            Some(config) => config.clone(),
            None => {
                let config = ResourceConfig {
                    id: self.allocate_id(),
                    resource_type: resource_type.to_string(),
                    base_resource_type: resource_types.base_type(resource_type).to_string(),
                    source_hash: source_hash.clone(),
                };
                tables.configs.insert(source_hash, config.clone());
                config
            }
        };

        let key = (config.id, version_key, params_hash.clone());
        let cache = match tables.caches.get(&key) {
            Some(cache) => cache.clone(),
            None => {
                let cache = UsedResourceCache {
                    id: self.allocate_id(),
                    resource_config: config,
                    version: version.clone(),
                    params_hash,
                    created_at: Utc::now(),
                };
                tables.caches.insert(key, cache.clone());
                cache
            }
        };
        tables.users.entry(cache.id).or_default().push(user);
        Ok(cache)
    }
}

/// Versions of the custom types `resource_type` resolves through.
fn custom_type_chain(
    resource_type: &str,
    resource_types: &VersionedResourceTypes,
) -> Vec<serde_json::Value> {
    let mut chain = Vec::new();
    let mut current = resource_type;
    while let Some(custom) = resource_types.lookup(current) {
        if chain.len() > resource_types.0.len() {
            break;
        }
        chain.push(json!({
            "name": custom.resource_type.name,
            "source": custom.resource_type.source,
            "version": custom.version,
        }));
        current = custom.resource_type.type_.as_str();
    }
    chain
}
