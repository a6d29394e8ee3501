//! In-memory fakes for worker traits (testing)
//!
//! Provides `MemoryWorker`, `MemoryContainer`, `MemoryVolume`,
//! `MemoryWorkerProvider` and `FakeWorkerPool`. Scripts are simulated: a
//! `MemoryWorker` is told what its `in` script does and counts every run.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io::{self, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use tokio_util::sync::CancellationToken;

use keel_core::VersionedResourceTypes;
use keel_state::{ContainerMetadata, ContainerOwner, UsedResourceCache};

use crate::archive::{normalize_entry_path, pack_files};
use crate::error::{WorkerError, WorkerResult};
use crate::pool::{WorkerPool, WorkerProvider};
use crate::spec::{ContainerSpec, WorkerSpec};
use crate::strategy::ContainerPlacementStrategy;
use crate::worker::{
    ByteStream, Container, GetOutcome, GetRequest, GetResponse, OutputStream, ProcessOutput,
    Volume, Worker,
};

// ---------------------------------------------------------------------------
// MemoryVolume
// ---------------------------------------------------------------------------

/// A volume holding files in memory.
pub struct MemoryVolume {
    handle: String,
    worker_name: String,
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    stream_out_error: Mutex<Option<WorkerError>>,
    stream_in_error: Mutex<Option<WorkerError>>,
    stream_out_paths: Mutex<Vec<String>>,
    stream_in_paths: Mutex<Vec<String>>,
    closed_streams: Arc<AtomicUsize>,
}

impl MemoryVolume {
    pub fn new(handle: impl Into<String>, worker_name: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            worker_name: worker_name.into(),
            files: Mutex::new(BTreeMap::new()),
            stream_out_error: Mutex::new(None),
            stream_in_error: Mutex::new(None),
            stream_out_paths: Mutex::new(Vec::new()),
            stream_in_paths: Mutex::new(Vec::new()),
            closed_streams: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_file(self, path: &str, contents: impl Into<Vec<u8>>) -> Self {
        self.files
            .lock()
            .unwrap()
            .insert(normalize_entry_path(path).to_string(), contents.into());
        self
    }

    /// Make every `stream_out` fail with `err`.
    pub fn failing_stream_out(self, err: WorkerError) -> Self {
        *self.stream_out_error.lock().unwrap() = Some(err);
        self
    }

    /// Make every `stream_in` fail with `err`.
    pub fn failing_stream_in(self, err: WorkerError) -> Self {
        *self.stream_in_error.lock().unwrap() = Some(err);
        self
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(normalize_entry_path(path))
            .cloned()
    }

    pub fn stream_out_paths(&self) -> Vec<String> {
        self.stream_out_paths.lock().unwrap().clone()
    }

    pub fn stream_in_paths(&self) -> Vec<String> {
        self.stream_in_paths.lock().unwrap().clone()
    }

    /// Number of `stream_out` streams that have been dropped.
    pub fn closed_streams(&self) -> usize {
        self.closed_streams.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for MemoryVolume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryVolume")
            .field("handle", &self.handle)
            .field("worker_name", &self.worker_name)
            .finish()
    }
}

/// Reader that counts itself closed when dropped.
struct TrackedStream {
    inner: io::Cursor<Vec<u8>>,
    closed: Arc<AtomicUsize>,
}

impl Read for TrackedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Volume for MemoryVolume {
    fn handle(&self) -> &str {
        &self.handle
    }

    fn worker_name(&self) -> &str {
        &self.worker_name
    }

    async fn stream_out(
        &self,
        cancel: &CancellationToken,
        path: &str,
    ) -> WorkerResult<ByteStream> {
        self.stream_out_paths.lock().unwrap().push(path.to_string());
        if cancel.is_cancelled() {
            return Err(WorkerError::Cancelled);
        }
        if let Some(err) = self.stream_out_error.lock().unwrap().clone() {
            return Err(err);
        }

        let prefix = normalize_entry_path(path);
        let files = self.files.lock().unwrap();
        let selected: Vec<(String, &[u8])> = files
            .iter()
            .filter_map(|(name, contents)| {
                let rel = if prefix.is_empty() {
                    Some(name.as_str())
                } else if name == prefix {
                    name.rsplit('/').next()
                } else {
                    name.strip_prefix(prefix).and_then(|r| r.strip_prefix('/'))
                };
                rel.map(|r| (format!("./{r}"), contents.as_slice()))
            })
            .collect();
        let entries: Vec<(&str, &[u8])> =
            selected.iter().map(|(n, c)| (n.as_str(), *c)).collect();
        let bytes = pack_files(&entries).map_err(|e| WorkerError::Stream {
            path: path.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Box::new(TrackedStream {
            inner: io::Cursor::new(bytes),
            closed: self.closed_streams.clone(),
        }))
    }

    async fn stream_in(
        &self,
        cancel: &CancellationToken,
        path: &str,
        stream: ByteStream,
    ) -> WorkerResult<()> {
        self.stream_in_paths.lock().unwrap().push(path.to_string());
        if cancel.is_cancelled() {
            return Err(WorkerError::Cancelled);
        }
        if let Some(err) = self.stream_in_error.lock().unwrap().clone() {
            return Err(err);
        }

        let stream_err = |e: io::Error| WorkerError::Stream {
            path: path.to_string(),
            reason: e.to_string(),
        };
        let prefix = normalize_entry_path(path);
        let mut archive = tar::Archive::new(GzDecoder::new(stream));
        let mut files = self.files.lock().unwrap();
        for entry in archive.entries().map_err(stream_err)? {
            let mut entry = entry.map_err(stream_err)?;
            if entry.header().entry_type().is_dir() {
                continue;
            }
            let name = entry.path().map_err(stream_err)?.to_string_lossy().into_owned();
            let name = normalize_entry_path(&name);
            let full = if prefix.is_empty() {
                name.to_string()
            } else {
                format!("{prefix}/{name}")
            };
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents).map_err(stream_err)?;
            files.insert(full, contents);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryWorker / MemoryContainer
// ---------------------------------------------------------------------------

/// What a simulated `in` script does.
#[derive(Debug, Clone)]
pub enum MemoryScript {
    /// Write `files` into a fresh volume and report `response`.
    Succeed {
        files: Vec<(String, Vec<u8>)>,
        response: GetResponse,
    },
    /// Exit non-zero, leaving `files` in the partial volume.
    Fail {
        exit_status: i32,
        files: Vec<(String, Vec<u8>)>,
    },
    /// The worker itself fails.
    Error(WorkerError),
}

impl Default for MemoryScript {
    fn default() -> Self {
        MemoryScript::Succeed {
            files: Vec::new(),
            response: GetResponse::default(),
        }
    }
}

struct ScriptState {
    worker_name: String,
    script: Mutex<MemoryScript>,
    delay: Mutex<Duration>,
    output: Mutex<Vec<String>>,
    runs: AtomicUsize,
    requests: Mutex<Vec<GetRequest>>,
    volumes: AtomicUsize,
}

/// A container whose `in` script is simulated by its worker.
pub struct MemoryContainer {
    handle: String,
    owner: ContainerOwner,
    state: Arc<ScriptState>,
}

impl fmt::Debug for MemoryContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryContainer")
            .field("handle", &self.handle)
            .field("owner", &self.owner)
            .finish()
    }
}

fn volume_with(handle: String, worker_name: &str, files: &[(String, Vec<u8>)]) -> Arc<dyn Volume> {
    let volume = files
        .iter()
        .fold(MemoryVolume::new(handle, worker_name), |v, (path, contents)| {
            v.with_file(path, contents.clone())
        });
    Arc::new(volume)
}

#[async_trait]
impl Container for MemoryContainer {
    fn handle(&self) -> &str {
        &self.handle
    }

    fn owner(&self) -> &ContainerOwner {
        &self.owner
    }

    async fn run_get(
        &self,
        cancel: &CancellationToken,
        request: &GetRequest,
        output: Arc<dyn ProcessOutput>,
    ) -> WorkerResult<GetOutcome> {
        let state = &self.state;
        state.runs.fetch_add(1, Ordering::SeqCst);
        state.requests.lock().unwrap().push(request.clone());

        let lines = state.output.lock().unwrap().clone();
        for line in lines {
            output.write(OutputStream::Stderr, &line);
        }

        let delay = *state.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if cancel.is_cancelled() {
            return Err(WorkerError::Cancelled);
        }

        let n = state.volumes.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = format!("{}-volume-{n}", state.worker_name);
        let script = state.script.lock().unwrap().clone();
        match script {
            MemoryScript::Succeed { files, response } => Ok(GetOutcome::Succeeded {
                volume: volume_with(handle, &state.worker_name, &files),
                response,
            }),
            MemoryScript::Fail { exit_status, files } => Ok(GetOutcome::Failed {
                exit_status,
                volume: Some(volume_with(handle, &state.worker_name, &files)),
            }),
            MemoryScript::Error(err) => Err(err),
        }
    }
}

/// Arguments of one `find_or_create_container` call.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerRequest {
    pub owner: ContainerOwner,
    pub metadata: ContainerMetadata,
    pub spec: ContainerSpec,
    pub resource_types: VersionedResourceTypes,
}

/// A worker with simulated containers and in-memory volumes.
pub struct MemoryWorker {
    name: String,
    team_id: Option<i32>,
    tags: Vec<String>,
    resource_types: Vec<String>,
    base_containers: usize,
    available_volume_space: u64,
    containers: Mutex<HashMap<ContainerOwner, Arc<MemoryContainer>>>,
    container_requests: Mutex<Vec<ContainerRequest>>,
    container_error: Mutex<Option<WorkerError>>,
    cache_volumes: Mutex<HashMap<i64, Arc<dyn Volume>>>,
    cache_lookups: AtomicUsize,
    state: Arc<ScriptState>,
}

impl MemoryWorker {
    /// A global, untagged worker providing the `git` type.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            state: Arc::new(ScriptState {
                worker_name: name.clone(),
                script: Mutex::new(MemoryScript::default()),
                delay: Mutex::new(Duration::ZERO),
                output: Mutex::new(Vec::new()),
                runs: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
                volumes: AtomicUsize::new(0),
            }),
            name,
            team_id: None,
            tags: Vec::new(),
            resource_types: vec!["git".to_string()],
            base_containers: 0,
            available_volume_space: 0,
            containers: Mutex::new(HashMap::new()),
            container_requests: Mutex::new(Vec::new()),
            container_error: Mutex::new(None),
            cache_volumes: Mutex::new(HashMap::new()),
            cache_lookups: AtomicUsize::new(0),
        }
    }

    pub fn with_team(mut self, team_id: i32) -> Self {
        self.team_id = Some(team_id);
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_resource_types(mut self, types: &[&str]) -> Self {
        self.resource_types = types.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_active_containers(mut self, n: usize) -> Self {
        self.base_containers = n;
        self
    }

    pub fn with_available_volume_space(mut self, bytes: u64) -> Self {
        self.available_volume_space = bytes;
        self
    }

    pub fn with_script(self, script: MemoryScript) -> Self {
        self.set_script(script);
        self
    }

    /// Delay every script run by `delay` (cancellable).
    pub fn with_script_delay(self, delay: Duration) -> Self {
        *self.state.delay.lock().unwrap() = delay;
        self
    }

    /// Lines every script run writes to stderr.
    pub fn with_script_output(self, lines: &[&str]) -> Self {
        *self.state.output.lock().unwrap() = lines.iter().map(|l| l.to_string()).collect();
        self
    }

    /// Make container creation fail with `err`.
    pub fn failing_container_creation(self, err: WorkerError) -> Self {
        *self.container_error.lock().unwrap() = Some(err);
        self
    }

    pub fn set_script(&self, script: MemoryScript) {
        *self.state.script.lock().unwrap() = script;
    }

    /// Number of times an `in` script ran on this worker.
    pub fn script_runs(&self) -> usize {
        self.state.runs.load(Ordering::SeqCst)
    }

    pub fn script_requests(&self) -> Vec<GetRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn container_requests(&self) -> Vec<ContainerRequest> {
        self.container_requests.lock().unwrap().clone()
    }

    pub fn cache_lookups(&self) -> usize {
        self.cache_lookups.load(Ordering::SeqCst)
    }

    /// The volume registered for a cache id.
    pub fn cache_volume(&self, cache_id: i64) -> Option<Arc<dyn Volume>> {
        self.cache_volumes.lock().unwrap().get(&cache_id).cloned()
    }

    /// Pretend `volume` was fetched for `cache` earlier.
    pub fn seed_cache_volume(&self, cache_id: i64, volume: Arc<dyn Volume>) {
        self.cache_volumes.lock().unwrap().insert(cache_id, volume);
    }
}

impl fmt::Debug for MemoryWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryWorker")
            .field("name", &self.name)
            .field("team_id", &self.team_id)
            .field("tags", &self.tags)
            .finish()
    }
}

#[async_trait]
impl Worker for MemoryWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn team_id(&self) -> Option<i32> {
        self.team_id
    }

    fn tags(&self) -> &[String] {
        &self.tags
    }

    fn resource_types(&self) -> &[String] {
        &self.resource_types
    }

    fn active_containers(&self) -> usize {
        self.base_containers + self.containers.lock().unwrap().len()
    }

    fn available_volume_space(&self) -> u64 {
        self.available_volume_space
    }

    async fn find_container_for_owner(
        &self,
        owner: &ContainerOwner,
    ) -> WorkerResult<Option<Arc<dyn Container>>> {
        Ok(self
            .containers
            .lock()
            .unwrap()
            .get(owner)
            .map(|c| c.clone() as Arc<dyn Container>))
    }

    async fn find_or_create_container(
        &self,
        cancel: &CancellationToken,
        owner: &ContainerOwner,
        metadata: &ContainerMetadata,
        spec: &ContainerSpec,
        resource_types: &VersionedResourceTypes,
    ) -> WorkerResult<Arc<dyn Container>> {
        self.container_requests
            .lock()
            .unwrap()
            .push(ContainerRequest {
                owner: owner.clone(),
                metadata: metadata.clone(),
                spec: spec.clone(),
                resource_types: resource_types.clone(),
            });
        if cancel.is_cancelled() {
            return Err(WorkerError::Cancelled);
        }
        if let Some(err) = self.container_error.lock().unwrap().clone() {
            return Err(err);
        }

        let mut containers = self.containers.lock().unwrap();
        let n = containers.len() + 1;
        let container = containers
            .entry(owner.clone())
            .or_insert_with(|| {
                Arc::new(MemoryContainer {
                    handle: format!("{}-container-{n}", self.name),
                    owner: owner.clone(),
                    state: self.state.clone(),
                })
            })
            .clone();
        Ok(container)
    }

    async fn find_volume_for_resource_cache(
        &self,
        cache: &UsedResourceCache,
    ) -> WorkerResult<Option<Arc<dyn Volume>>> {
        self.cache_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.cache_volume(cache.id))
    }

    async fn initialize_resource_cache(
        &self,
        volume: Arc<dyn Volume>,
        cache: &UsedResourceCache,
    ) -> WorkerResult<()> {
        self.cache_volumes.lock().unwrap().insert(cache.id, volume);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryWorkerProvider
// ---------------------------------------------------------------------------

/// A fixed list of running workers.
#[derive(Default)]
pub struct MemoryWorkerProvider {
    workers: Vec<Arc<dyn Worker>>,
    failure: Option<WorkerError>,
}

impl MemoryWorkerProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker(mut self, worker: Arc<dyn Worker>) -> Self {
        self.workers.push(worker);
        self
    }

    pub fn failing_with(mut self, err: WorkerError) -> Self {
        self.failure = Some(err);
        self
    }
}

#[async_trait]
impl WorkerProvider for MemoryWorkerProvider {
    async fn running_workers(&self) -> WorkerResult<Vec<Arc<dyn Worker>>> {
        match &self.failure {
            Some(err) => Err(err.clone()),
            None => Ok(self.workers.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// FakeWorkerPool
// ---------------------------------------------------------------------------

/// Arguments of one `find_or_choose_worker_for_container` call.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacementRequest {
    pub owner: ContainerOwner,
    pub container_spec: ContainerSpec,
    pub worker_spec: WorkerSpec,
    pub strategy: &'static str,
}

/// A pool that always answers with one worker (or one error) and records
/// what it was asked.
pub struct FakeWorkerPool {
    answer: Result<Arc<dyn Worker>, WorkerError>,
    requests: Mutex<Vec<PlacementRequest>>,
}

impl FakeWorkerPool {
    pub fn returning(worker: Arc<dyn Worker>) -> Self {
        Self {
            answer: Ok(worker),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_with(err: WorkerError) -> Self {
        Self {
            answer: Err(err),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<PlacementRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkerPool for FakeWorkerPool {
    async fn find_or_choose_worker_for_container(
        &self,
        _cancel: &CancellationToken,
        owner: &ContainerOwner,
        container_spec: &ContainerSpec,
        worker_spec: &WorkerSpec,
        strategy: &dyn ContainerPlacementStrategy,
    ) -> WorkerResult<Arc<dyn Worker>> {
        self.requests.lock().unwrap().push(PlacementRequest {
            owner: owner.clone(),
            container_spec: container_spec.clone(),
            worker_spec: worker_spec.clone(),
            strategy: strategy.name(),
        });
        self.answer.clone()
    }
}
