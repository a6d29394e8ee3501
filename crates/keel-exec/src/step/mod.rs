//! Executable steps of a build plan.

pub mod composite;
pub mod get;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use keel_core::PlanId;

use crate::error::ExecResult;
use crate::run_state::RunState;

pub use composite::{AggregateStep, OnSuccessStep, RetryStep, SequenceStep, TimeoutStep};
pub use get::{GetArtifactSource, GetStep};

/// One node of a build's step tree.
///
/// `run` returns an error only for failures the build cannot recover from;
/// a step that ran but did not succeed (for example a resource script that
/// exited non-zero) returns `Ok(())` and reports `succeeded() == false`.
#[derive(Debug)]
pub enum Step {
    Get(GetStep),
    Aggregate(AggregateStep),
    Sequence(SequenceStep),
    OnSuccess(OnSuccessStep),
    Retry(RetryStep),
    Timeout(TimeoutStep),
}

impl Step {
    pub fn run<'a>(
        &'a mut self,
        cancel: &'a CancellationToken,
        state: &'a RunState,
    ) -> BoxFuture<'a, ExecResult<()>> {
        match self {
            Step::Get(step) => Box::pin(step.run(cancel, state)),
            Step::Aggregate(step) => Box::pin(step.run(cancel, state)),
            Step::Sequence(step) => Box::pin(step.run(cancel, state)),
            Step::OnSuccess(step) => Box::pin(step.run(cancel, state)),
            Step::Retry(step) => Box::pin(step.run(cancel, state)),
            Step::Timeout(step) => Box::pin(step.run(cancel, state)),
        }
    }

    pub fn succeeded(&self) -> bool {
        match self {
            Step::Get(step) => step.succeeded(),
            Step::Aggregate(step) => step.succeeded(),
            Step::Sequence(step) => step.succeeded(),
            Step::OnSuccess(step) => step.succeeded(),
            Step::Retry(step) => step.succeeded(),
            Step::Timeout(step) => step.succeeded(),
        }
    }

    pub fn plan_id(&self) -> &PlanId {
        match self {
            Step::Get(step) => step.plan_id(),
            Step::Aggregate(step) => step.plan_id(),
            Step::Sequence(step) => step.plan_id(),
            Step::OnSuccess(step) => step.plan_id(),
            Step::Retry(step) => step.plan_id(),
            Step::Timeout(step) => step.plan_id(),
        }
    }
}
