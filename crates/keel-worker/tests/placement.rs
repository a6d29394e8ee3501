//! Worker placement through the public pool API.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use keel_core::{PlanId, ResourceType, VersionedResourceType, VersionedResourceTypes};
use keel_state::ContainerOwner;
use keel_worker::fakes::{MemoryWorker, MemoryWorkerProvider};
use keel_worker::{
    ContainerSpec, MostAvailableVolumeSpace, PlacementStrategyKind, Pool, WorkerError,
    Worker, WorkerPool, WorkerSpec,
};

fn owner() -> ContainerOwner {
    ContainerOwner::build_step(42, PlanId::new("56"), 123)
}

fn custom_type() -> VersionedResourceTypes {
    VersionedResourceTypes::new(vec![VersionedResourceType {
        resource_type: ResourceType {
            name: "custom-resource".into(),
            type_: "registry-image".into(),
            ..Default::default()
        },
        version: Default::default(),
    }])
}

#[tokio::test]
async fn tagged_custom_type_work_lands_on_matching_worker() {
    let provider = MemoryWorkerProvider::new()
        .with_worker(Arc::new(
            MemoryWorker::new("untagged").with_resource_types(&["registry-image"]),
        ))
        .with_worker(Arc::new(
            MemoryWorker::new("gpu-git")
                .with_tags(&["gpu"])
                .with_resource_types(&["git"]),
        ))
        .with_worker(Arc::new(
            MemoryWorker::new("gpu-image")
                .with_tags(&["gpu", "linux"])
                .with_resource_types(&["registry-image"]),
        ));
    let pool = Pool::new(Arc::new(provider));

    let spec = WorkerSpec {
        resource_type: "custom-resource".into(),
        tags: vec!["gpu".into()],
        team_id: 123,
        resource_types: custom_type(),
    };
    let chosen = pool
        .find_or_choose_worker_for_container(
            &CancellationToken::new(),
            &owner(),
            &ContainerSpec::default(),
            &spec,
            PlacementStrategyKind::default().strategy().as_ref(),
        )
        .await
        .unwrap();

    assert_eq!(chosen.name(), "gpu-image");
}

#[tokio::test]
async fn team_workers_are_reserved() {
    let provider = MemoryWorkerProvider::new()
        .with_worker(Arc::new(MemoryWorker::new("team-a").with_team(1)))
        .with_worker(Arc::new(MemoryWorker::new("team-b").with_team(2)));
    let pool = Pool::new(Arc::new(provider));

    let spec = WorkerSpec {
        resource_type: "git".into(),
        team_id: 3,
        ..Default::default()
    };
    let err = pool
        .find_or_choose_worker_for_container(
            &CancellationToken::new(),
            &owner(),
            &ContainerSpec::default(),
            &spec,
            &MostAvailableVolumeSpace,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, WorkerError::NoCompatibleWorkers { team_id: 3, .. }));
}

#[tokio::test]
async fn provider_errors_propagate() {
    let provider =
        MemoryWorkerProvider::new().failing_with(WorkerError::Process("registry down".into()));
    let pool = Pool::new(Arc::new(provider));

    let err = pool
        .find_or_choose_worker_for_container(
            &CancellationToken::new(),
            &owner(),
            &ContainerSpec::default(),
            &WorkerSpec::default(),
            &MostAvailableVolumeSpace,
        )
        .await
        .unwrap_err();

    assert_eq!(err, WorkerError::Process("registry down".into()));
}
