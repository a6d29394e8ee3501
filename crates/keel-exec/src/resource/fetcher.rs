//! Fetching resource versions onto workers.
//!
//! At most one fetch of a given signature runs on a given worker at a time.
//! Contending fetches wait on a named lock and then reuse the volume the
//! winner initialised as the resource cache.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use keel_core::VersionedResourceTypes;
use keel_state::{ContainerMetadata, LockFactory, LockId, StorageError};
use keel_worker::{
    ContainerSpec, GetOutcome, GetRequest, OutputStream, ProcessOutput, Volume, Worker,
    WorkerError,
};

use crate::error::FetchError;
use crate::obs;
use crate::resource::instance::ResourceInstance;

/// Container details a fetch runs with.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchSession {
    pub metadata: ContainerMetadata,
}

/// Everything a fetch needs.
#[derive(Clone)]
pub struct FetchRequest {
    pub session: FetchSession,
    /// Receives the `in` script's output.
    pub handler: Arc<dyn ProcessOutput>,
    pub worker: Arc<dyn Worker>,
    pub container_spec: ContainerSpec,
    pub resource_types: VersionedResourceTypes,
    pub instance: ResourceInstance,
}

impl fmt::Debug for FetchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchRequest")
            .field("session", &self.session)
            .field("worker", &self.worker.name())
            .field("container_spec", &self.container_spec)
            .field("instance", &self.instance)
            .finish()
    }
}

/// Produces a volume holding a fetched resource version.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(
        &self,
        cancel: &CancellationToken,
        request: FetchRequest,
    ) -> Result<Arc<dyn Volume>, FetchError>;
}

/// [`Fetcher`] that deduplicates fetches with a named lock per signature and
/// worker, polling while another holder fetches.
pub struct ResourceFetcher {
    locks: Arc<dyn LockFactory>,
    poll_interval: Duration,
}

impl ResourceFetcher {
    pub fn new(locks: Arc<dyn LockFactory>, poll_interval: Duration) -> Self {
        Self {
            locks,
            poll_interval,
        }
    }

    async fn find_initialized(
        &self,
        request: &FetchRequest,
    ) -> Result<Option<Arc<dyn Volume>>, FetchError> {
        Ok(request
            .worker
            .find_volume_for_resource_cache(request.instance.resource_cache())
            .await?)
    }

    /// Runs with the fetch lock held.
    async fn fetch_locked(
        &self,
        cancel: &CancellationToken,
        request: &FetchRequest,
        lock_name: &str,
    ) -> Result<Arc<dyn Volume>, FetchError> {
        let worker = &request.worker;
        if let Some(volume) = self.find_initialized(request).await? {
            obs::emit_fetch_cache_hit(lock_name, worker.name(), volume.handle());
            return Ok(volume);
        }

        let instance = &request.instance;
        let container = worker
            .find_or_create_container(
                cancel,
                instance.container_owner(),
                &request.session.metadata,
                &request.container_spec,
                &request.resource_types,
            )
            .await?;

        let get = GetRequest {
            source: instance.source().clone(),
            params: instance.params().clone(),
            version: instance.version().clone(),
            space: instance.space().clone(),
        };
        match container
            .run_get(cancel, &get, request.handler.clone())
            .await?
        {
            GetOutcome::Succeeded { volume, .. } => {
                obs::emit_fetch_script_finished(lock_name, worker.name(), 0);
                worker
                    .initialize_resource_cache(volume.clone(), instance.resource_cache())
                    .await?;
                Ok(volume)
            }
            GetOutcome::Failed {
                exit_status,
                volume,
            } => {
                obs::emit_fetch_script_finished(lock_name, worker.name(), exit_status);
                Err(FetchError::ScriptFailed {
                    exit_status,
                    volume,
                })
            }
        }
    }
}

fn cancelled_as_fetch_error(err: FetchError) -> FetchError {
    match err {
        FetchError::Worker(WorkerError::Cancelled) => FetchError::Cancelled,
        other => other,
    }
}

#[async_trait]
impl Fetcher for ResourceFetcher {
    #[instrument(skip_all, fields(
        worker = request.worker.name(),
        resource_type = request.instance.resource_type(),
    ))]
    async fn fetch(
        &self,
        cancel: &CancellationToken,
        request: FetchRequest,
    ) -> Result<Arc<dyn Volume>, FetchError> {
        let worker_name = request.worker.name().to_string();
        let lock_name = request
            .instance
            .lock_name(&worker_name)
            .map_err(StorageError::from)?;
        let lock_id = LockId::resource_fetch(&lock_name);
        let mut announced = false;

        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            if let Some(volume) = self.find_initialized(&request).await? {
                obs::emit_fetch_cache_hit(&lock_name, &worker_name, volume.handle());
                return Ok(volume);
            }

            if let Some(lock) = self.locks.acquire(&lock_id).await? {
                debug!(lock = %lock_id, "acquired fetch lock");
                let result = self.fetch_locked(cancel, &request, &lock_name).await;
                if let Err(err) = lock.release() {
                    warn!(lock = %lock_id, error = %err, "failed to release fetch lock");
                }
                return result.map_err(cancelled_as_fetch_error);
            }

            if !announced {
                obs::emit_fetch_lock_waiting(&lock_name, &worker_name);
                request.handler.write(
                    OutputStream::Stderr,
                    "waiting for another fetch of this version to finish\n",
                );
                announced = true;
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}
