//! Worker selection.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use keel_state::ContainerOwner;

use crate::error::{WorkerError, WorkerResult};
use crate::spec::{ContainerSpec, WorkerSpec};
use crate::strategy::ContainerPlacementStrategy;
use crate::worker::Worker;

/// Source of the workers currently registered and running.
#[async_trait]
pub trait WorkerProvider: Send + Sync {
    async fn running_workers(&self) -> WorkerResult<Vec<Arc<dyn Worker>>>;
}

/// Picks the worker a step's container runs on.
#[async_trait]
pub trait WorkerPool: Send + Sync {
    async fn find_or_choose_worker_for_container(
        &self,
        cancel: &CancellationToken,
        owner: &ContainerOwner,
        container_spec: &ContainerSpec,
        worker_spec: &WorkerSpec,
        strategy: &dyn ContainerPlacementStrategy,
    ) -> WorkerResult<Arc<dyn Worker>>;
}

/// Pool over a [`WorkerProvider`].
///
/// Compatible workers are those that satisfy the worker spec. A worker that
/// already holds a container for the owner wins; otherwise the strategy
/// decides.
pub struct Pool {
    provider: Arc<dyn WorkerProvider>,
}

impl Pool {
    pub fn new(provider: Arc<dyn WorkerProvider>) -> Self {
        Self { provider }
    }

    async fn compatible_workers(&self, spec: &WorkerSpec) -> WorkerResult<Vec<Arc<dyn Worker>>> {
        let workers = self.provider.running_workers().await?;
        if workers.is_empty() {
            return Err(WorkerError::NoWorkers);
        }

        let compatible: Vec<_> = workers.into_iter().filter(|w| w.satisfies(spec)).collect();
        if compatible.is_empty() {
            return Err(WorkerError::NoCompatibleWorkers {
                resource_type: spec.resource_type.clone(),
                tags: spec.tags.clone(),
                team_id: spec.team_id,
            });
        }
        Ok(compatible)
    }
}

#[async_trait]
impl WorkerPool for Pool {
    #[instrument(skip_all, fields(owner = %owner, strategy = strategy.name()))]
    async fn find_or_choose_worker_for_container(
        &self,
        cancel: &CancellationToken,
        owner: &ContainerOwner,
        container_spec: &ContainerSpec,
        worker_spec: &WorkerSpec,
        strategy: &dyn ContainerPlacementStrategy,
    ) -> WorkerResult<Arc<dyn Worker>> {
        if cancel.is_cancelled() {
            return Err(WorkerError::Cancelled);
        }

        let compatible = self.compatible_workers(worker_spec).await?;

        for worker in &compatible {
            if worker.find_container_for_owner(owner).await?.is_some() {
                debug!(worker = worker.name(), "reusing worker with existing container");
                return Ok(worker.clone());
            }
        }

        let chosen = strategy.choose(&compatible, container_spec)?;
        debug!(worker = chosen.name(), "chose worker");
        Ok(chosen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{MemoryWorker, MemoryWorkerProvider};
    use crate::strategy::FewestBuildContainers;
    use keel_core::PlanId;
    use keel_state::ContainerMetadata;

    fn owner() -> ContainerOwner {
        ContainerOwner::build_step(42, PlanId::new("56"), 123)
    }

    fn git_spec() -> WorkerSpec {
        WorkerSpec {
            resource_type: "git".into(),
            team_id: 123,
            ..Default::default()
        }
    }

    async fn choose(pool: &Pool, spec: &WorkerSpec) -> WorkerResult<Arc<dyn Worker>> {
        pool.find_or_choose_worker_for_container(
            &CancellationToken::new(),
            &owner(),
            &ContainerSpec::default(),
            spec,
            &FewestBuildContainers,
        )
        .await
    }

    #[tokio::test]
    async fn no_running_workers() {
        let pool = Pool::new(Arc::new(MemoryWorkerProvider::new()));
        let err = choose(&pool, &git_spec()).await.unwrap_err();
        assert_eq!(err, WorkerError::NoWorkers);
    }

    #[tokio::test]
    async fn no_compatible_workers_reports_constraints() {
        let provider = MemoryWorkerProvider::new()
            .with_worker(Arc::new(MemoryWorker::new("w").with_resource_types(&["s3"])));
        let pool = Pool::new(Arc::new(provider));
        let err = choose(&pool, &git_spec()).await.unwrap_err();
        assert_eq!(
            err,
            WorkerError::NoCompatibleWorkers {
                resource_type: "git".into(),
                tags: vec![],
                team_id: 123,
            }
        );
    }

    #[tokio::test]
    async fn filters_by_team_and_type_before_strategy() {
        let provider = MemoryWorkerProvider::new()
            .with_worker(Arc::new(MemoryWorker::new("other-team").with_team(7)))
            .with_worker(Arc::new(
                MemoryWorker::new("wrong-type").with_resource_types(&["s3"]),
            ))
            .with_worker(Arc::new(MemoryWorker::new("busy").with_active_containers(5)))
            .with_worker(Arc::new(MemoryWorker::new("idle").with_active_containers(1)));
        let pool = Pool::new(Arc::new(provider));
        let chosen = choose(&pool, &git_spec()).await.unwrap();
        assert_eq!(chosen.name(), "idle");
    }

    #[tokio::test]
    async fn worker_holding_owner_container_is_reused() {
        let busy: Arc<dyn Worker> = Arc::new(MemoryWorker::new("busy").with_active_containers(9));
        busy.find_or_create_container(
            &CancellationToken::new(),
            &owner(),
            &ContainerMetadata::default(),
            &ContainerSpec::default(),
            &Default::default(),
        )
        .await
        .unwrap();

        let provider = MemoryWorkerProvider::new()
            .with_worker(busy)
            .with_worker(Arc::new(MemoryWorker::new("idle")));
        let pool = Pool::new(Arc::new(provider));
        let chosen = choose(&pool, &git_spec()).await.unwrap();
        assert_eq!(chosen.name(), "busy");
    }

    #[tokio::test]
    async fn cancelled_selection_fails_fast() {
        let pool = Pool::new(Arc::new(MemoryWorkerProvider::new()));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = pool
            .find_or_choose_worker_for_container(
                &cancel,
                &owner(),
                &ContainerSpec::default(),
                &git_spec(),
                &FewestBuildContainers,
            )
            .await
            .unwrap_err();
        assert_eq!(err, WorkerError::Cancelled);
    }
}
