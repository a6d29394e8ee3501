//! The get step: fetch one version of a resource and register it as an
//! artifact of the build.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use keel_core::creds::{evaluate_params, evaluate_source};
use keel_core::{GetPlan, PlanId, Version};
use keel_state::{Build, ContainerMetadata, ContainerOwner, Resource, ResourceCacheUser};
use keel_worker::artifact::open_entry;
use keel_worker::{
    ArtifactDestination, ArtifactError, ArtifactSource, ContainerSpec, FileStream, ImageSpec,
    Volume, WorkerSpec,
};

use crate::artifact::ArtifactName;
use crate::delegate::{ExitStatus, GetDelegate, GetEventHandler, VersionInfo};
use crate::error::{ExecError, ExecResult, FetchError};
use crate::factory::StepFactory;
use crate::obs;
use crate::resource::{FetchRequest, FetchSession, ResourceInstance};
use crate::run_state::RunState;
use crate::step_metadata::StepMetadata;

/// Fetches a resource version onto a worker.
///
/// A non-zero exit of the resource's `in` script is a step failure, not an
/// error: `run` returns `Ok(())`, `succeeded()` is false and the delegate
/// sees the exit status. Infrastructure failures are returned unchanged and
/// the delegate never hears that the step finished.
pub struct GetStep {
    plan_id: PlanId,
    plan: GetPlan,
    build: Arc<dyn Build>,
    step_metadata: Arc<dyn StepMetadata>,
    container_metadata: ContainerMetadata,
    delegate: Arc<dyn GetDelegate>,
    factory: StepFactory,
    succeeded: bool,
}

impl fmt::Debug for GetStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GetStep")
            .field("plan_id", &self.plan_id)
            .field("name", &self.plan.name)
            .field("resource", &self.plan.resource)
            .field("succeeded", &self.succeeded)
            .finish()
    }
}

impl GetStep {
    pub(crate) fn new(
        plan_id: PlanId,
        plan: GetPlan,
        build: Arc<dyn Build>,
        step_metadata: Arc<dyn StepMetadata>,
        container_metadata: ContainerMetadata,
        delegate: Arc<dyn GetDelegate>,
        factory: StepFactory,
    ) -> Self {
        Self {
            plan_id,
            plan,
            build,
            step_metadata,
            container_metadata,
            delegate,
            factory,
            succeeded: false,
        }
    }

    pub fn plan_id(&self) -> &PlanId {
        &self.plan_id
    }

    pub fn plan(&self) -> &GetPlan {
        &self.plan
    }

    pub fn succeeded(&self) -> bool {
        self.succeeded
    }

    pub async fn run(&mut self, cancel: &CancellationToken, state: &RunState) -> ExecResult<()> {
        let span = obs::step_span(self.build.id(), &self.plan_id, &self.plan.name);
        let result = self
            .fetch_and_register(cancel, state)
            .instrument(span)
            .await
            .map_err(ExecError::or_cancelled);
        if let Err(err) = &result {
            obs::emit_step_errored(&self.plan_id, err);
        }
        result
    }

    async fn fetch_and_register(
        &mut self,
        cancel: &CancellationToken,
        state: &RunState,
    ) -> ExecResult<()> {
        self.succeeded = false;
        self.delegate.initializing();
        obs::emit_step_initializing(&self.plan_id, &self.plan.name, &self.plan.type_);

        let variables = self
            .factory
            .variables_factory()
            .new_variables(self.build.team_name(), self.build.pipeline_name());
        let source = evaluate_source(variables.as_ref(), &self.plan.source)?;
        let params = evaluate_params(variables.as_ref(), &self.plan.params)?;
        let resource_types = self
            .plan
            .versioned_resource_types
            .evaluate(variables.as_ref())?;
        let version = self.version(state)?;

        let resource = if self.plan.is_pipeline_resource() {
            Some(self.pipeline_resource().await?)
        } else {
            None
        };

        let config = self.factory.config();
        let team_id = self.build.team_id();
        let container_spec = ContainerSpec {
            image_spec: ImageSpec::for_resource_type(&self.plan.type_),
            team_id,
            env: self.step_metadata.env(),
            limits: config.container_limits,
        };
        let worker_spec = WorkerSpec {
            resource_type: self.plan.type_.clone(),
            tags: self.plan.tags.clone(),
            team_id,
            resource_types: resource_types.clone(),
        };
        let owner = ContainerOwner::build_step(self.build.id(), self.plan_id.clone(), team_id);
        let strategy = config.placement_strategy.strategy();

        let worker = self
            .factory
            .pool()
            .find_or_choose_worker_for_container(
                cancel,
                &owner,
                &container_spec,
                &worker_spec,
                strategy.as_ref(),
            )
            .await?;
        obs::emit_worker_selected(&self.plan_id, worker.name());

        let cache = self
            .factory
            .cache_factory()
            .find_or_create_resource_cache(
                ResourceCacheUser::ForBuild(self.build.id()),
                &self.plan.type_,
                &version,
                &source,
                &params,
                &resource_types,
            )
            .await?;

        let instance = ResourceInstance::new(
            self.plan.type_.clone(),
            self.plan.space.clone(),
            version.clone(),
            source,
            params,
            resource_types.clone(),
            cache,
            owner,
        );

        let mut session = FetchSession {
            metadata: self.container_metadata.clone(),
        };
        session.metadata.working_directory = config.get_working_directory.clone();

        self.delegate.starting();
        let request = FetchRequest {
            session,
            handler: Arc::new(GetEventHandler::new(
                self.delegate.clone(),
                self.plan_id.clone(),
                self.plan.name.clone(),
            )),
            worker,
            container_spec,
            resource_types,
            instance,
        };

        let volume = match self.factory.fetcher().fetch(cancel, request).await {
            Ok(volume) => volume,
            Err(FetchError::ScriptFailed {
                exit_status,
                volume,
            }) => {
                if let Some(volume) = volume {
                    self.register(state, volume);
                }
                self.delegate
                    .finished(ExitStatus(exit_status), &VersionInfo::default());
                obs::emit_step_finished(&self.plan_id, exit_status, false);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        self.register(state, volume);

        let metadata = match &resource {
            Some(resource) => resource.get_metadata(&self.plan.space, &version).await?,
            None => None,
        };
        let info = VersionInfo { version, metadata };

        state.store_result(self.plan_id.clone(), info.clone());
        self.succeeded = true;
        self.delegate.finished(ExitStatus(0), &info);
        obs::emit_step_finished(&self.plan_id, 0, true);
        Ok(())
    }

    /// The plan's own version, else the version an earlier step stored.
    fn version(&self, state: &RunState) -> ExecResult<Version> {
        if let Some(version) = &self.plan.version {
            return Ok(version.clone());
        }
        self.plan
            .version_from
            .as_ref()
            .and_then(|from| state.result(from))
            .map(|info| info.version)
            .ok_or_else(|| ExecError::VersionMissing {
                plan_id: self.plan_id.clone(),
            })
    }

    async fn pipeline_resource(&self) -> ExecResult<Arc<dyn Resource>> {
        let pipeline = self
            .build
            .pipeline()
            .await?
            .ok_or_else(|| ExecError::PipelineNotFound {
                pipeline_name: self.build.pipeline_name().to_string(),
            })?;

        pipeline
            .resource(&self.plan.resource)
            .await?
            .ok_or_else(|| ExecError::ResourceNotFound {
                resource_name: self.plan.resource.clone(),
            })
    }

    fn register(&self, state: &RunState, volume: Arc<dyn Volume>) {
        let replaced = state
            .artifacts()
            .register_source(
                ArtifactName::new(self.plan.name.clone()),
                Arc::new(GetArtifactSource::new(volume)),
            )
            .is_some();
        obs::emit_artifact_registered(&self.plan.name, replaced);
    }
}

/// Artifact backed by the volume a get step fetched.
#[derive(Debug, Clone)]
pub struct GetArtifactSource {
    volume: Arc<dyn Volume>,
}

impl GetArtifactSource {
    pub fn new(volume: Arc<dyn Volume>) -> Self {
        Self { volume }
    }

    pub fn volume(&self) -> &Arc<dyn Volume> {
        &self.volume
    }
}

#[async_trait]
impl ArtifactSource for GetArtifactSource {
    async fn stream_to(
        &self,
        cancel: &CancellationToken,
        destination: &dyn ArtifactDestination,
    ) -> Result<(), ArtifactError> {
        let stream = self.volume.stream_out(cancel, ".").await?;
        destination.stream_in(cancel, ".", stream).await
    }

    async fn stream_file(
        &self,
        cancel: &CancellationToken,
        path: &str,
    ) -> Result<FileStream, ArtifactError> {
        let stream = self.volume.stream_out(cancel, ".").await?;
        open_entry(stream, path).await
    }
}
