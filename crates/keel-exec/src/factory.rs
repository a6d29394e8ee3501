//! Building step trees from plans.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use keel_core::{GetPlan, Plan, PlanId, PlanKind, VariablesFactory};
use keel_state::{Build, ContainerMetadata, ContainerType, ResourceCacheFactory};
use keel_worker::WorkerPool;

use crate::config::EngineConfig;
use crate::delegate::{DelegateFactory, GetDelegate};
use crate::resource::Fetcher;
use crate::step::{
    AggregateStep, GetStep, OnSuccessStep, RetryStep, SequenceStep, Step, TimeoutStep,
};
use crate::step_metadata::StepMetadata;

/// Creates steps wired to the engine's collaborators.
///
/// Cloning is cheap; every step keeps a clone of the factory that made it.
#[derive(Clone)]
pub struct StepFactory {
    pool: Arc<dyn WorkerPool>,
    fetcher: Arc<dyn Fetcher>,
    cache_factory: Arc<dyn ResourceCacheFactory>,
    variables_factory: Arc<dyn VariablesFactory>,
    config: EngineConfig,
}

impl fmt::Debug for StepFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepFactory")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl StepFactory {
    pub fn new(
        pool: Arc<dyn WorkerPool>,
        fetcher: Arc<dyn Fetcher>,
        cache_factory: Arc<dyn ResourceCacheFactory>,
        variables_factory: Arc<dyn VariablesFactory>,
        config: EngineConfig,
    ) -> Self {
        Self {
            pool,
            fetcher,
            cache_factory,
            variables_factory,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn pool(&self) -> &dyn WorkerPool {
        self.pool.as_ref()
    }

    pub(crate) fn fetcher(&self) -> &dyn Fetcher {
        self.fetcher.as_ref()
    }

    pub(crate) fn cache_factory(&self) -> &dyn ResourceCacheFactory {
        self.cache_factory.as_ref()
    }

    pub(crate) fn variables_factory(&self) -> &dyn VariablesFactory {
        self.variables_factory.as_ref()
    }

    /// A get step for `plan`.
    pub fn get(
        &self,
        plan_id: PlanId,
        plan: GetPlan,
        build: Arc<dyn Build>,
        step_metadata: Arc<dyn StepMetadata>,
        container_metadata: ContainerMetadata,
        delegate: Arc<dyn GetDelegate>,
    ) -> GetStep {
        GetStep::new(
            plan_id,
            plan,
            build,
            step_metadata,
            container_metadata,
            delegate,
            self.clone(),
        )
    }

    /// The step tree for `plan`.
    ///
    /// Each get step's container metadata is `container_metadata` with the
    /// container type, step name and retry attempt filled in.
    pub fn step_for(
        &self,
        plan: &Plan,
        build: &Arc<dyn Build>,
        step_metadata: &Arc<dyn StepMetadata>,
        container_metadata: &ContainerMetadata,
        delegates: &dyn DelegateFactory,
    ) -> Step {
        let child = |plan: &Plan, metadata: &ContainerMetadata| {
            self.step_for(plan, build, step_metadata, metadata, delegates)
        };

        match &plan.kind {
            PlanKind::Get(get) => {
                let mut metadata = container_metadata.clone();
                metadata.container_type = Some(ContainerType::Get);
                metadata.step_name = get.name.clone();
                metadata.build_id = build.id();
                Step::Get(self.get(
                    plan.id.clone(),
                    get.clone(),
                    build.clone(),
                    step_metadata.clone(),
                    metadata,
                    delegates.get_delegate(&plan.id, &get.name),
                ))
            }
            PlanKind::Aggregate(plans) => Step::Aggregate(AggregateStep::new(
                plan.id.clone(),
                plans.iter().map(|p| child(p, container_metadata)).collect(),
            )),
            PlanKind::Do(plans) => Step::Sequence(SequenceStep::new(
                plan.id.clone(),
                plans.iter().map(|p| child(p, container_metadata)).collect(),
            )),
            PlanKind::OnSuccess(on_success) => Step::OnSuccess(OnSuccessStep::new(
                plan.id.clone(),
                child(&on_success.step, container_metadata),
                child(&on_success.next, container_metadata),
            )),
            PlanKind::Retry(attempts) => Step::Retry(RetryStep::new(
                plan.id.clone(),
                attempts
                    .iter()
                    .enumerate()
                    .map(|(i, p)| {
                        let mut metadata = container_metadata.clone();
                        metadata.attempt = (i + 1).to_string();
                        child(p, &metadata)
                    })
                    .collect(),
            )),
            PlanKind::Timeout(timeout) => Step::Timeout(TimeoutStep::new(
                plan.id.clone(),
                Duration::from_secs(timeout.duration_secs),
                child(&timeout.step, container_metadata),
            )),
        }
    }
}
