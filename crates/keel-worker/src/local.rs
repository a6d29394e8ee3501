//! Local process runtime.
//!
//! `LocalWorker` runs resource scripts as plain child processes on this
//! machine. Volumes are directories under `<work_dir>/volumes`; resource
//! types are directories `<types_dir>/<type>/` holding an executable `in`.
//!
//! There is no isolation: scripts run as the current user with the
//! container spec's env added to the inherited environment.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use keel_core::VersionedResourceTypes;
use keel_state::{ContainerMetadata, ContainerOwner, UsedResourceCache};

use crate::archive;
use crate::error::{WorkerError, WorkerResult};
use crate::spec::ContainerSpec;
use crate::worker::{
    ByteStream, Container, GetOutcome, GetRequest, GetResponse, OutputStream, ProcessOutput,
    Volume, Worker,
};

/// Name of the script a resource type runs for a get.
pub const IN_SCRIPT: &str = "in";

// ---------------------------------------------------------------------------
// LocalVolume
// ---------------------------------------------------------------------------

/// A directory acting as a volume.
#[derive(Debug, Clone)]
pub struct LocalVolume {
    handle: String,
    worker_name: String,
    path: PathBuf,
}

impl LocalVolume {
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.path.join(archive::normalize_entry_path(path))
    }

    fn volume_error(&self, reason: impl fmt::Display) -> WorkerError {
        WorkerError::Volume {
            handle: self.handle.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl Volume for LocalVolume {
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
        if cancel.is_cancelled() {
            return Err(WorkerError::Cancelled);
        }
        let source = self.resolve(path);
        let bytes = tokio::task::spawn_blocking(move || archive::pack(&source))
            .await
            .map_err(|e| self.volume_error(e))?
            .map_err(|e| WorkerError::Stream {
                path: path.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Box::new(std::io::Cursor::new(bytes)))
    }

    async fn stream_in(
        &self,
        cancel: &CancellationToken,
        path: &str,
        stream: ByteStream,
    ) -> WorkerResult<()> {
        if cancel.is_cancelled() {
            return Err(WorkerError::Cancelled);
        }
        let dest = self.resolve(path);
        tokio::task::spawn_blocking(move || archive::unpack(stream, &dest))
            .await
            .map_err(|e| self.volume_error(e))?
            .map_err(|e| WorkerError::Stream {
                path: path.to_string(),
                reason: e.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// LocalContainer
// ---------------------------------------------------------------------------

/// Execution context for one container owner.
#[derive(Debug)]
pub struct LocalContainer {
    handle: String,
    owner: ContainerOwner,
    worker_name: String,
    script_dir: PathBuf,
    volumes_dir: PathBuf,
    env: Vec<(String, String)>,
}

impl LocalContainer {
    fn new_volume(&self) -> WorkerResult<LocalVolume> {
        let handle = Uuid::new_v4().to_string();
        let path = self.volumes_dir.join(&handle);
        std::fs::create_dir_all(&path).map_err(|e| WorkerError::Volume {
            handle: handle.clone(),
            reason: e.to_string(),
        })?;
        Ok(LocalVolume {
            handle,
            worker_name: self.worker_name.clone(),
            path,
        })
    }
}

fn parse_env(env: &[String]) -> Vec<(String, String)> {
    env.iter()
        .filter_map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect()
}

#[async_trait]
impl Container for LocalContainer {
    fn handle(&self) -> &str {
        &self.handle
    }

    fn owner(&self) -> &ContainerOwner {
        &self.owner
    }

    #[instrument(skip_all, fields(container = %self.handle))]
    async fn run_get(
        &self,
        cancel: &CancellationToken,
        request: &GetRequest,
        output: Arc<dyn ProcessOutput>,
    ) -> WorkerResult<GetOutcome> {
        let volume = self.new_volume()?;
        let script = self.script_dir.join(IN_SCRIPT);
        let input = serde_json::to_vec(request).map_err(|e| WorkerError::Process(e.to_string()))?;

        debug!(script = %script.display(), volume = %volume.handle, "running in script");
        let mut child = Command::new(&script)
            .arg(&volume.path)
            .current_dir(&volume.path)
            .envs(self.env.iter().cloned())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WorkerError::Process(format!("{}: {e}", script.display())))?;

        let stdout_task = child.stdout.take().map(|mut stdout| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                stdout.read_to_end(&mut buf).await.map(|_| buf)
            })
        });
        let stderr_task = child.stderr.take().map(|stderr| {
            let output = output.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    output.write(OutputStream::Stderr, &format!("{line}\n"));
                }
            })
        });
        // A script may exit without reading its request; the exit status decides.
        let stdin_task = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                match stdin.write_all(&input).await {
                    Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
                    other => other,
                }
            })
        });

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };
        let Some(status) = waited else {
            if let Some(task) = &stdin_task {
                task.abort();
            }
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill in script");
            }
            return Err(WorkerError::Cancelled);
        };
        let status = status.map_err(|e| WorkerError::Process(e.to_string()))?;

        let written = match stdin_task {
            Some(task) => task
                .await
                .map_err(|e| WorkerError::Process(e.to_string()))?
                .map_err(|e| WorkerError::Process(format!("writing request: {e}"))),
            None => Ok(()),
        };

        if let Some(task) = stderr_task {
            let _ = task.await;
        }
        let stdout = match stdout_task {
            Some(task) => task
                .await
                .map_err(|e| WorkerError::Process(e.to_string()))?
                .map_err(|e| WorkerError::Process(e.to_string()))?,
            None => Vec::new(),
        };

        let volume: Arc<dyn Volume> = Arc::new(volume);
        if !status.success() {
            return Ok(GetOutcome::Failed {
                exit_status: status.code().unwrap_or(-1),
                volume: Some(volume),
            });
        }
        written?;

        let response: GetResponse = serde_json::from_slice(&stdout).map_err(|e| {
            WorkerError::Process(format!("invalid in script response: {e}"))
        })?;
        Ok(GetOutcome::Succeeded { volume, response })
    }
}

// ---------------------------------------------------------------------------
// LocalWorker
// ---------------------------------------------------------------------------

/// A worker backed by the local machine.
pub struct LocalWorker {
    name: String,
    team_id: Option<i32>,
    tags: Vec<String>,
    types_dir: PathBuf,
    volumes_dir: PathBuf,
    resource_types: Vec<String>,
    containers: Mutex<HashMap<ContainerOwner, Arc<LocalContainer>>>,
    cache_volumes: Mutex<HashMap<i64, Arc<dyn Volume>>>,
}

impl LocalWorker {
    /// A worker storing volumes under `work_dir` and providing every type
    /// found under `types_dir`.
    pub fn new(
        name: impl Into<String>,
        work_dir: impl Into<PathBuf>,
        types_dir: impl Into<PathBuf>,
    ) -> WorkerResult<Self> {
        let name = name.into();
        let types_dir = types_dir.into();
        let volumes_dir = work_dir.into().join("volumes");
        std::fs::create_dir_all(&volumes_dir).map_err(|e| WorkerError::Volume {
            handle: volumes_dir.display().to_string(),
            reason: e.to_string(),
        })?;

        let resource_types = discover_types(&types_dir)?;
        debug!(worker = %name, types = ?resource_types, "local worker ready");

        Ok(Self {
            name,
            team_id: None,
            tags: Vec::new(),
            types_dir,
            volumes_dir,
            resource_types,
            containers: Mutex::new(HashMap::new()),
            cache_volumes: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_team(mut self, team_id: i32) -> Self {
        self.team_id = Some(team_id);
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

fn discover_types(types_dir: &Path) -> WorkerResult<Vec<String>> {
    let entries = match std::fs::read_dir(types_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(WorkerError::Process(format!("{}: {e}", types_dir.display()))),
    };
    let mut types: Vec<String> = entries
        .filter_map(Result::ok)
        .filter(|e| e.path().join(IN_SCRIPT).is_file())
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .collect();
    types.sort();
    Ok(types)
}

impl fmt::Debug for LocalWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalWorker")
            .field("name", &self.name)
            .field("types_dir", &self.types_dir)
            .finish()
    }
}

#[async_trait]
impl Worker for LocalWorker {
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
        self.containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn available_volume_space(&self) -> u64 {
        u64::MAX
    }

    async fn find_container_for_owner(
        &self,
        owner: &ContainerOwner,
    ) -> WorkerResult<Option<Arc<dyn Container>>> {
        Ok(self
            .containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(owner)
            .map(|c| c.clone() as Arc<dyn Container>))
    }

    #[instrument(skip_all, fields(worker = %self.name, owner = %owner))]
    async fn find_or_create_container(
        &self,
        cancel: &CancellationToken,
        owner: &ContainerOwner,
        metadata: &ContainerMetadata,
        spec: &ContainerSpec,
        resource_types: &VersionedResourceTypes,
    ) -> WorkerResult<Arc<dyn Container>> {
        if cancel.is_cancelled() {
            return Err(WorkerError::Cancelled);
        }

        let base = resource_types.base_type(&spec.image_spec.resource_type);
        let script_dir = self.types_dir.join(base);
        if !script_dir.join(IN_SCRIPT).is_file() {
            return Err(WorkerError::ContainerCreation {
                owner: owner.to_string(),
                reason: format!("resource type '{base}' not found in {}", self.types_dir.display()),
            });
        }

        let mut containers = self
            .containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let container = containers
            .entry(owner.clone())
            .or_insert_with(|| {
                let handle = Uuid::new_v4().to_string();
                debug!(handle = %handle, step = %metadata.step_name, "created container");
                Arc::new(LocalContainer {
                    handle,
                    owner: owner.clone(),
                    worker_name: self.name.clone(),
                    script_dir,
                    volumes_dir: self.volumes_dir.clone(),
                    env: parse_env(&spec.env),
                })
            })
            .clone();
        Ok(container)
    }

    async fn find_volume_for_resource_cache(
        &self,
        cache: &UsedResourceCache,
    ) -> WorkerResult<Option<Arc<dyn Volume>>> {
        Ok(self
            .cache_volumes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&cache.id)
            .cloned())
    }

    async fn initialize_resource_cache(
        &self,
        volume: Arc<dyn Volume>,
        cache: &UsedResourceCache,
    ) -> WorkerResult<()> {
        debug!(volume = volume.handle(), cache = cache.id, "initialized resource cache");
        self.cache_volumes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(cache.id, volume);
        Ok(())
    }
}
