//! Get step behaviour against in-memory collaborators.

use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use keel_core::{
    sha256_hex, CredsError, GetPlan, MetadataField, PlanId, Space, StaticVariables,
    StaticVariablesFactory, Version, VersionedResourceTypes,
};
use keel_exec::fakes::{FakeFetcher, RecordingGetDelegate};
use keel_exec::{
    EngineConfig, ExecError, ExecResult, ExitStatus, FetchError, GetStep, Origin, RunState,
    StepFactory, StepMetadata, VersionInfo,
};
use keel_state::fakes::{MemoryBuild, MemoryPipeline, MemoryResource, MemoryResourceCacheFactory};
use keel_state::{
    Build, ContainerMetadata, ContainerOwner, ContainerType, ResourceCacheUser, StorageError,
};
use keel_worker::fakes::{FakeWorkerPool, MemoryVolume, MemoryWorker};
use keel_worker::{
    ArtifactError, ArtifactSource, ContainerSpec, ImageSpec, OutputStream, Volume, VolumeDestination, Worker,
    WorkerError, WorkerSpec,
};

const TEAM_ID: i32 = 123;
const BUILD_ID: i64 = 42;
const PLAN_ID: &str = "56";

// ============================================================================
// Fixtures
// ============================================================================

fn version() -> Version {
    [("some-version".to_string(), "some-value".to_string())].into()
}

fn metadata() -> Vec<MetadataField> {
    vec![MetadataField::new("some", "metadata")]
}

fn resource_types() -> VersionedResourceTypes {
    serde_json::from_value(json!([{
        "name": "custom-resource",
        "type": "custom-type",
        "source": {"some-custom": "((source-param))"},
        "version": {"some-custom": "version"}
    }]))
    .unwrap()
}

fn evaluated_resource_types() -> VersionedResourceTypes {
    serde_json::from_value(json!([{
        "name": "custom-resource",
        "type": "custom-type",
        "source": {"some-custom": "super-secret-source"},
        "version": {"some-custom": "version"}
    }]))
    .unwrap()
}

fn get_plan() -> GetPlan {
    GetPlan {
        name: "some-name".into(),
        resource: "some-pipeline-resource".into(),
        type_: "some-resource-type".into(),
        space: Space::new("space"),
        source: [("some".to_string(), json!("((source-param))"))].into(),
        params: [("some-param".to_string(), json!("some-value"))].into(),
        tags: vec!["some".into(), "tags".into()],
        version: Some(version()),
        versioned_resource_types: resource_types(),
        ..Default::default()
    }
}

fn anonymous_plan() -> GetPlan {
    GetPlan {
        resource: String::new(),
        ..get_plan()
    }
}

fn step_env() -> Vec<String> {
    vec!["a=1".into(), "b=2".into()]
}

fn container_metadata() -> ContainerMetadata {
    ContainerMetadata {
        pipeline_id: 4567,
        container_type: Some(ContainerType::Get),
        step_name: "some-step".into(),
        ..Default::default()
    }
}

fn owner() -> ContainerOwner {
    ContainerOwner::build_step(BUILD_ID, PlanId::new(PLAN_ID), TEAM_ID)
}

fn pipeline_resource() -> Arc<MemoryResource> {
    Arc::new(
        MemoryResource::new(1, "some-pipeline-resource", "some-resource-type").with_version(
            Space::new("space"),
            version(),
            metadata(),
        ),
    )
}

fn pipeline_with(resource: Arc<MemoryResource>) -> Arc<MemoryPipeline> {
    Arc::new(MemoryPipeline::new(4567, "pipeline").with_resource(resource))
}

fn build_with(pipeline: Arc<MemoryPipeline>) -> Arc<MemoryBuild> {
    Arc::new(MemoryBuild::new(BUILD_ID, TEAM_ID, "pipeline").with_pipeline(pipeline))
}

fn fetched_volume() -> Arc<MemoryVolume> {
    Arc::new(MemoryVolume::new("some-volume", "some-worker").with_file("some-path", "file-content"))
}

/// Collaborators of one get step.
struct Rig {
    worker: Arc<MemoryWorker>,
    pool: Arc<FakeWorkerPool>,
    fetcher: Arc<FakeFetcher>,
    caches: Arc<MemoryResourceCacheFactory>,
    delegate: Arc<RecordingGetDelegate>,
    state: RunState,
}

impl Rig {
    fn new(fetcher: FakeFetcher) -> Self {
        let worker = Arc::new(MemoryWorker::new("some-worker"));
        Self::with_pool(FakeWorkerPool::returning(worker.clone()), fetcher, worker)
    }

    fn fetching(volume: Arc<MemoryVolume>) -> Self {
        Self::new(FakeFetcher::returning(volume))
    }

    fn with_pool(pool: FakeWorkerPool, fetcher: FakeFetcher, worker: Arc<MemoryWorker>) -> Self {
        Self {
            worker,
            pool: Arc::new(pool),
            fetcher: Arc::new(fetcher),
            caches: Arc::new(MemoryResourceCacheFactory::new()),
            delegate: Arc::new(RecordingGetDelegate::new()),
            state: RunState::new(),
        }
    }

    fn factory(&self) -> StepFactory {
        let variables = StaticVariables::new().with("source-param", "super-secret-source");
        StepFactory::new(
            self.pool.clone(),
            self.fetcher.clone(),
            self.caches.clone(),
            Arc::new(StaticVariablesFactory::new(variables)),
            EngineConfig::default(),
        )
    }

    fn step(&self, build: Arc<dyn Build>, plan: GetPlan) -> GetStep {
        let env: Arc<dyn StepMetadata> = Arc::new(step_env());
        self.factory().get(
            PlanId::new(PLAN_ID),
            plan,
            build,
            env,
            container_metadata(),
            self.delegate.clone(),
        )
    }

    async fn run(&self, build: Arc<dyn Build>, plan: GetPlan) -> (GetStep, ExecResult<()>) {
        let mut step = self.step(build, plan);
        let result = step.run(&CancellationToken::new(), &self.state).await;
        (step, result)
    }

    async fn run_pipeline_get(&self) -> (GetStep, ExecResult<()>) {
        self.run(build_with(pipeline_with(pipeline_resource())), get_plan())
            .await
    }
}

// ============================================================================
// Pipeline resource: lookups and worker selection
// ============================================================================

#[tokio::test]
async fn pipeline_get_finds_pipeline_and_resource() {
    let rig = Rig::fetching(fetched_volume());
    let resource = pipeline_resource();
    let pipeline = pipeline_with(resource.clone());
    let build = build_with(pipeline.clone());

    let (_, result) = rig.run(build.clone(), get_plan()).await;

    result.unwrap();
    assert_eq!(build.pipeline_call_count(), 1);
    assert_eq!(pipeline.resource_call_count(), 1);
}

#[tokio::test]
async fn pipeline_get_chooses_worker_for_build_step_owner() {
    let rig = Rig::fetching(fetched_volume());
    rig.run_pipeline_get().await.1.unwrap();

    let requests = rig.pool.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.owner, owner());
    assert_eq!(
        request.container_spec,
        ContainerSpec {
            image_spec: ImageSpec::for_resource_type("some-resource-type"),
            team_id: TEAM_ID,
            env: step_env(),
            ..Default::default()
        }
    );
    assert_eq!(
        request.worker_spec,
        WorkerSpec {
            resource_type: "some-resource-type".into(),
            tags: vec!["some".into(), "tags".into()],
            team_id: TEAM_ID,
            resource_types: evaluated_resource_types(),
        }
    );
    assert_eq!(request.strategy, "fewest-build-containers");
}

#[tokio::test]
async fn pipeline_get_fetches_with_session_worker_and_instance() {
    let rig = Rig::fetching(fetched_volume());
    rig.run_pipeline_get().await.1.unwrap();

    let requests = rig.fetcher.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];

    assert_eq!(
        request.session.metadata,
        ContainerMetadata {
            pipeline_id: 4567,
            container_type: Some(ContainerType::Get),
            step_name: "some-step".into(),
            working_directory: "/tmp/build/get".into(),
            ..Default::default()
        }
    );
    assert_eq!(request.worker.name(), "some-worker");
    assert_eq!(request.container_spec.env, step_env());
    assert_eq!(request.resource_types, evaluated_resource_types());

    let instance = &request.instance;
    assert_eq!(instance.resource_type(), "some-resource-type");
    assert_eq!(instance.space(), &Space::new("space"));
    assert_eq!(instance.version(), &version());
    assert_eq!(instance.source()["some"], json!("super-secret-source"));
    assert_eq!(instance.params()["some-param"], json!("some-value"));
    assert_eq!(instance.resource_types(), &evaluated_resource_types());
    assert_eq!(instance.container_owner(), &owner());

    let reference = r#"{"type":"some-resource-type","space":"space","version":{"some-version":"some-value"},"source":{"some":"super-secret-source"},"params":{"some-param":"some-value"},"worker_name":"fake-worker"}"#;
    assert_eq!(
        instance.lock_name("fake-worker").unwrap(),
        sha256_hex(reference.as_bytes())
    );
}

#[tokio::test]
async fn pipeline_get_creates_resource_cache_for_build() {
    let rig = Rig::fetching(fetched_volume());
    rig.run_pipeline_get().await.1.unwrap();

    let cache_requests = rig.caches.requests();
    assert_eq!(cache_requests.len(), 1);
    let cache_request = &cache_requests[0];
    assert_eq!(cache_request.user, ResourceCacheUser::ForBuild(BUILD_ID));
    assert_eq!(cache_request.resource_type, "some-resource-type");
    assert_eq!(cache_request.version, version());
    assert_eq!(cache_request.source["some"], json!("super-secret-source"));
    assert_eq!(cache_request.resource_types, evaluated_resource_types());

    let fetched = rig.fetcher.requests();
    let cache = fetched[0].instance.resource_cache();
    assert_eq!(
        rig.caches.users_of(cache.id),
        vec![ResourceCacheUser::ForBuild(BUILD_ID)]
    );
}

#[tokio::test]
async fn script_output_reaches_delegate_with_origin() {
    let rig = Rig::new(FakeFetcher::returning(fetched_volume()).with_output(&["cloning\n"]));
    rig.run_pipeline_get().await.1.unwrap();

    assert_eq!(
        rig.delegate.outputs(),
        vec![(
            Origin {
                plan_id: PlanId::new(PLAN_ID),
                name: "some-name".into(),
                stream: OutputStream::Stdout,
            },
            "cloning\n".to_string()
        )]
    );
}

// ============================================================================
// Pipeline resource: fetch succeeds
// ============================================================================

#[tokio::test]
async fn successful_fetch_finishes_with_version_and_metadata() {
    let rig = Rig::fetching(fetched_volume());
    let resource = pipeline_resource();

    let (step, result) = rig
        .run(build_with(pipeline_with(resource.clone())), get_plan())
        .await;

    result.unwrap();
    assert!(step.succeeded());
    assert_eq!(
        resource.metadata_calls(),
        vec![(Space::new("space"), version())]
    );

    let expected = VersionInfo {
        version: version(),
        metadata: Some(metadata()),
    };
    assert_eq!(rig.delegate.initializing_calls(), 1);
    assert_eq!(rig.delegate.starting_calls(), 1);
    assert_eq!(
        rig.delegate.finished_calls(),
        vec![(ExitStatus(0), expected.clone())]
    );
    assert_eq!(rig.state.result(&PlanId::new(PLAN_ID)), Some(expected));
}

#[tokio::test]
async fn metadata_not_found_finishes_without_metadata() {
    let rig = Rig::fetching(fetched_volume());
    let bare = Arc::new(MemoryResource::new(
        1,
        "some-pipeline-resource",
        "some-resource-type",
    ));

    let (step, result) = rig.run(build_with(pipeline_with(bare)), get_plan()).await;

    result.unwrap();
    assert!(step.succeeded());
    assert_eq!(
        rig.delegate.finished_calls(),
        vec![(
            ExitStatus(0),
            VersionInfo {
                version: version(),
                metadata: None,
            }
        )]
    );
}

#[tokio::test]
async fn metadata_lookup_error_is_returned() {
    let rig = Rig::fetching(fetched_volume());
    let disaster = StorageError::Backend("nope".into());
    let failing = Arc::new(
        MemoryResource::new(1, "some-pipeline-resource", "some-resource-type")
            .failing_metadata_lookup(disaster.clone()),
    );

    let (step, result) = rig
        .run(build_with(pipeline_with(failing)), get_plan())
        .await;

    assert_eq!(result.unwrap_err(), ExecError::Storage(disaster));
    assert!(!step.succeeded());
    assert!(rig.delegate.finished_calls().is_empty());
}

// ============================================================================
// Registered artifact
// ============================================================================

async fn registered_source(volume: Arc<MemoryVolume>) -> (Rig, Arc<dyn ArtifactSource>) {
    let rig = Rig::fetching(volume);
    rig.run_pipeline_get().await.1.unwrap();
    let source = rig
        .state
        .artifacts()
        .source_for(&"some-name".into())
        .expect("artifact registered under the plan name");
    (rig, source)
}

#[tokio::test]
async fn artifact_streams_whole_volume_to_destination() {
    let volume = fetched_volume();
    let (_rig, source) = registered_source(volume.clone()).await;
    let dest = Arc::new(MemoryVolume::new("dest", "other"));

    source
        .stream_to(&CancellationToken::new(), &VolumeDestination::new(dest.clone()))
        .await
        .unwrap();

    assert_eq!(volume.stream_out_paths(), vec!["."]);
    assert_eq!(dest.stream_in_paths(), vec!["."]);
    assert_eq!(dest.file("some-path").unwrap(), b"file-content");
}

#[tokio::test]
async fn artifact_stream_to_returns_stream_out_error() {
    let disaster = WorkerError::Stream {
        path: ".".into(),
        reason: "nope".into(),
    };
    let volume = Arc::new(MemoryVolume::new("v", "w").failing_stream_out(disaster.clone()));
    let (_rig, source) = registered_source(volume).await;
    let dest = Arc::new(MemoryVolume::new("dest", "other"));

    let err = source
        .stream_to(&CancellationToken::new(), &VolumeDestination::new(dest))
        .await
        .unwrap_err();

    assert_eq!(err, ArtifactError::Worker(disaster));
}

#[tokio::test]
async fn artifact_stream_to_returns_stream_in_error() {
    let disaster = WorkerError::Stream {
        path: ".".into(),
        reason: "disk full".into(),
    };
    let (_rig, source) = registered_source(fetched_volume()).await;
    let dest = Arc::new(MemoryVolume::new("dest", "other").failing_stream_in(disaster.clone()));

    let err = source
        .stream_to(&CancellationToken::new(), &VolumeDestination::new(dest))
        .await
        .unwrap_err();

    assert_eq!(err, ArtifactError::Worker(disaster));
}

#[tokio::test]
async fn artifact_streams_out_a_single_file() {
    let volume = fetched_volume();
    let (_rig, source) = registered_source(volume.clone()).await;

    let file = source
        .stream_file(&CancellationToken::new(), "some-path")
        .await
        .unwrap();

    assert_eq!(file.read_all().unwrap(), b"file-content");
    assert_eq!(volume.stream_out_paths(), vec!["."]);
}

#[tokio::test]
async fn closing_file_stream_closes_volume_stream() {
    let volume = fetched_volume();
    let (_rig, source) = registered_source(volume.clone()).await;

    let file = source
        .stream_file(&CancellationToken::new(), "some-path")
        .await
        .unwrap();
    assert_eq!(volume.closed_streams(), 0);

    file.close();
    assert_eq!(volume.closed_streams(), 1);
}

#[tokio::test]
async fn empty_volume_has_no_file() {
    let (_rig, source) = registered_source(Arc::new(MemoryVolume::new("v", "w"))).await;

    let err = source
        .stream_file(&CancellationToken::new(), "some-path")
        .await
        .unwrap_err();

    assert_eq!(
        err,
        ArtifactError::FileNotFound {
            path: "some-path".into()
        }
    );
}

#[tokio::test]
async fn stream_file_returns_stream_out_error() {
    let disaster = WorkerError::Stream {
        path: ".".into(),
        reason: "nope".into(),
    };
    let volume = Arc::new(MemoryVolume::new("v", "w").failing_stream_out(disaster.clone()));
    let (_rig, source) = registered_source(volume).await;

    let err = source
        .stream_file(&CancellationToken::new(), "some-path")
        .await
        .unwrap_err();

    assert_eq!(err, ArtifactError::Worker(disaster));
}

// ============================================================================
// Fetch failures
// ============================================================================

#[tokio::test]
async fn script_failure_is_not_an_error() {
    let rig = Rig::new(FakeFetcher::failing_with(FetchError::ScriptFailed {
        exit_status: 42,
        volume: None,
    }));

    let (step, result) = rig.run_pipeline_get().await;

    result.unwrap();
    assert!(!step.succeeded());
    assert_eq!(
        rig.delegate.finished_calls(),
        vec![(ExitStatus(42), VersionInfo::default())]
    );
    assert!(rig.state.artifacts().is_empty());
    assert!(rig.state.result(&PlanId::new(PLAN_ID)).is_none());
}

#[tokio::test]
async fn script_failure_registers_partial_volume() {
    let partial: Arc<dyn Volume> = Arc::new(MemoryVolume::new("partial", "w").with_file("log", "x"));
    let rig = Rig::new(FakeFetcher::failing_with(FetchError::ScriptFailed {
        exit_status: 1,
        volume: Some(partial),
    }));

    let (step, result) = rig.run_pipeline_get().await;

    result.unwrap();
    assert!(!step.succeeded());
    let source = rig.state.artifacts().source_for(&"some-name".into()).unwrap();
    let file = source
        .stream_file(&CancellationToken::new(), "log")
        .await
        .unwrap();
    assert_eq!(file.read_all().unwrap(), b"x");
}

#[tokio::test]
async fn fetch_error_is_returned_without_finishing() {
    let disaster = WorkerError::Process("nope".into());
    let rig = Rig::new(FakeFetcher::failing_with(FetchError::Worker(disaster.clone())));

    let (step, result) = rig.run_pipeline_get().await;

    assert_eq!(result.unwrap_err(), ExecError::Worker(disaster));
    assert!(!step.succeeded());
    assert!(rig.delegate.finished_calls().is_empty());
    assert!(rig.state.artifacts().is_empty());
}

#[tokio::test]
async fn worker_selection_error_is_returned_without_fetching() {
    let disaster = WorkerError::NoWorkers;
    let worker = Arc::new(MemoryWorker::new("unused"));
    let rig = Rig::with_pool(
        FakeWorkerPool::failing_with(disaster.clone()),
        FakeFetcher::returning(fetched_volume()),
        worker,
    );

    let (step, result) = rig.run_pipeline_get().await;

    assert_eq!(result.unwrap_err(), ExecError::Worker(disaster));
    assert!(!step.succeeded());
    assert_eq!(rig.fetcher.fetch_count(), 0);
    assert!(rig.delegate.finished_calls().is_empty());
    assert_eq!(rig.worker.script_runs(), 0);
}

// ============================================================================
// Pipeline and resource lookup failures
// ============================================================================

#[tokio::test]
async fn resource_lookup_error_is_returned() {
    let rig = Rig::fetching(fetched_volume());
    let disaster = StorageError::Backend("nope".into());
    let pipeline =
        Arc::new(MemoryPipeline::new(4567, "pipeline").failing_resource_lookup(disaster.clone()));

    let (_, result) = rig.run(build_with(pipeline), get_plan()).await;

    assert_eq!(result.unwrap_err(), ExecError::Storage(disaster));
    assert!(rig.pool.requests().is_empty());
}

#[tokio::test]
async fn missing_resource_is_resource_not_found() {
    let rig = Rig::fetching(fetched_volume());
    let pipeline = Arc::new(MemoryPipeline::new(4567, "pipeline"));

    let (_, result) = rig.run(build_with(pipeline), get_plan()).await;

    assert_eq!(
        result.unwrap_err(),
        ExecError::ResourceNotFound {
            resource_name: "some-pipeline-resource".into()
        }
    );
}

#[tokio::test]
async fn pipeline_lookup_error_is_returned() {
    let rig = Rig::fetching(fetched_volume());
    let disaster = StorageError::Backend("nope".into());
    let build = Arc::new(
        MemoryBuild::new(BUILD_ID, TEAM_ID, "pipeline").failing_pipeline_lookup(disaster.clone()),
    );

    let (_, result) = rig.run(build, get_plan()).await;

    assert_eq!(result.unwrap_err(), ExecError::Storage(disaster));
}

#[tokio::test]
async fn missing_pipeline_is_pipeline_not_found() {
    let rig = Rig::fetching(fetched_volume());
    let build = Arc::new(MemoryBuild::new(BUILD_ID, TEAM_ID, "pipeline"));

    let (step, result) = rig.run(build, get_plan()).await;

    assert_eq!(
        result.unwrap_err(),
        ExecError::PipelineNotFound {
            pipeline_name: "pipeline".into()
        }
    );
    assert!(!step.succeeded());
    assert!(rig.delegate.finished_calls().is_empty());
}

// ============================================================================
// Anonymous resource
// ============================================================================

#[tokio::test]
async fn anonymous_get_skips_pipeline_and_metadata() {
    let rig = Rig::fetching(fetched_volume());
    let resource = pipeline_resource();
    let build = build_with(pipeline_with(resource.clone()));

    let (step, result) = rig.run(build.clone(), anonymous_plan()).await;

    result.unwrap();
    assert!(step.succeeded());
    assert_eq!(build.pipeline_call_count(), 0);
    assert!(resource.metadata_calls().is_empty());
    assert_eq!(rig.pool.requests().len(), 1);
    assert_eq!(rig.fetcher.fetch_count(), 1);
    assert_eq!(
        rig.delegate.finished_calls(),
        vec![(
            ExitStatus(0),
            VersionInfo {
                version: version(),
                metadata: None,
            }
        )]
    );
    assert!(rig.state.artifacts().source_for(&"some-name".into()).is_some());
}

// ============================================================================
// Versions and credentials
// ============================================================================

#[tokio::test]
async fn undefined_variable_fails_before_worker_selection() {
    let rig = Rig::fetching(fetched_volume());
    let plan = GetPlan {
        source: [("uri".to_string(), json!("((missing))"))].into(),
        ..anonymous_plan()
    };

    let (_, result) = rig
        .run(Arc::new(MemoryBuild::new(BUILD_ID, TEAM_ID, "pipeline")), plan)
        .await;

    assert_eq!(
        result.unwrap_err(),
        ExecError::Creds(CredsError::UndefinedVariables(vec!["missing".into()]))
    );
    assert!(rig.pool.requests().is_empty());
    assert_eq!(rig.delegate.initializing_calls(), 1);
    assert_eq!(rig.delegate.starting_calls(), 0);
}

#[tokio::test]
async fn version_from_earlier_step_is_fetched() {
    let rig = Rig::fetching(fetched_volume());
    let earlier: Version = [("ref".to_string(), "abc".to_string())].into();
    rig.state.store_result(
        PlanId::new("1"),
        VersionInfo {
            version: earlier.clone(),
            metadata: None,
        },
    );
    let plan = GetPlan {
        version: None,
        version_from: Some(PlanId::new("1")),
        ..anonymous_plan()
    };

    let (_, result) = rig
        .run(Arc::new(MemoryBuild::new(BUILD_ID, TEAM_ID, "pipeline")), plan)
        .await;

    result.unwrap();
    assert_eq!(rig.fetcher.requests()[0].instance.version(), &earlier);
}

#[tokio::test]
async fn missing_version_is_an_error() {
    let rig = Rig::fetching(fetched_volume());
    let plan = GetPlan {
        version: None,
        version_from: Some(PlanId::new("1")),
        ..anonymous_plan()
    };

    let (_, result) = rig
        .run(Arc::new(MemoryBuild::new(BUILD_ID, TEAM_ID, "pipeline")), plan)
        .await;

    assert_eq!(
        result.unwrap_err(),
        ExecError::VersionMissing {
            plan_id: PlanId::new(PLAN_ID)
        }
    );
}
