//! Steps that combine other steps.

use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use keel_core::PlanId;

use crate::error::{ExecError, ExecResult};
use crate::obs;
use crate::run_state::RunState;
use crate::step::Step;

/// Runs every child at once.
#[derive(Debug)]
pub struct AggregateStep {
    plan_id: PlanId,
    steps: Vec<Step>,
}

impl AggregateStep {
    pub fn new(plan_id: PlanId, steps: Vec<Step>) -> Self {
        Self { plan_id, steps }
    }

    pub fn plan_id(&self) -> &PlanId {
        &self.plan_id
    }

    pub async fn run(&mut self, cancel: &CancellationToken, state: &RunState) -> ExecResult<()> {
        let tokens: Vec<CancellationToken> =
            self.steps.iter().map(|_| cancel.child_token()).collect();
        let results = join_all(
            self.steps
                .iter_mut()
                .zip(&tokens)
                .map(|(step, token)| step.run(token, state)),
        )
        .await;

        let errors: Vec<ExecError> = results.into_iter().filter_map(Result::err).collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ExecError::Aggregate(errors))
        }
    }

    pub fn succeeded(&self) -> bool {
        self.steps.iter().all(Step::succeeded)
    }
}

/// Runs children in order, stopping at the first that errors or fails.
#[derive(Debug)]
pub struct SequenceStep {
    plan_id: PlanId,
    steps: Vec<Step>,
}

impl SequenceStep {
    pub fn new(plan_id: PlanId, steps: Vec<Step>) -> Self {
        Self { plan_id, steps }
    }

    pub fn plan_id(&self) -> &PlanId {
        &self.plan_id
    }

    pub async fn run(&mut self, cancel: &CancellationToken, state: &RunState) -> ExecResult<()> {
        for step in &mut self.steps {
            step.run(cancel, state).await?;
            if !step.succeeded() {
                debug!(plan_id = %step.plan_id(), "stopping sequence after failed step");
                break;
            }
        }
        Ok(())
    }

    pub fn succeeded(&self) -> bool {
        self.steps.iter().all(Step::succeeded)
    }
}

/// Runs `next` only if `step` succeeded.
#[derive(Debug)]
pub struct OnSuccessStep {
    plan_id: PlanId,
    step: Box<Step>,
    next: Box<Step>,
}

impl OnSuccessStep {
    pub fn new(plan_id: PlanId, step: Step, next: Step) -> Self {
        Self {
            plan_id,
            step: Box::new(step),
            next: Box::new(next),
        }
    }

    pub fn plan_id(&self) -> &PlanId {
        &self.plan_id
    }

    pub async fn run(&mut self, cancel: &CancellationToken, state: &RunState) -> ExecResult<()> {
        self.step.run(cancel, state).await?;
        if !self.step.succeeded() {
            return Ok(());
        }
        self.next.run(cancel, state).await
    }

    pub fn succeeded(&self) -> bool {
        self.step.succeeded() && self.next.succeeded()
    }
}

/// Runs attempts in order until one succeeds.
///
/// The outcome is that of the last attempt run. Cancellation ends the retry
/// immediately.
#[derive(Debug)]
pub struct RetryStep {
    plan_id: PlanId,
    attempts: Vec<Step>,
    last_attempt: Option<usize>,
}

impl RetryStep {
    pub fn new(plan_id: PlanId, attempts: Vec<Step>) -> Self {
        Self {
            plan_id,
            attempts,
            last_attempt: None,
        }
    }

    pub fn plan_id(&self) -> &PlanId {
        &self.plan_id
    }

    pub async fn run(&mut self, cancel: &CancellationToken, state: &RunState) -> ExecResult<()> {
        let mut result = Ok(());
        for (i, attempt) in self.attempts.iter_mut().enumerate() {
            self.last_attempt = Some(i);
            result = attempt.run(cancel, state).await;
            if cancel.is_cancelled() {
                break;
            }
            if result.is_ok() && attempt.succeeded() {
                break;
            }
            debug!(plan_id = %self.plan_id, attempt = i + 1, "attempt did not succeed");
        }
        result
    }

    pub fn succeeded(&self) -> bool {
        self.last_attempt
            .and_then(|i| self.attempts.get(i))
            .is_some_and(Step::succeeded)
    }
}

/// Cancels its child once `duration` has passed.
#[derive(Debug)]
pub struct TimeoutStep {
    plan_id: PlanId,
    duration: Duration,
    step: Box<Step>,
    timed_out: bool,
}

impl TimeoutStep {
    pub fn new(plan_id: PlanId, duration: Duration, step: Step) -> Self {
        Self {
            plan_id,
            duration,
            step: Box::new(step),
            timed_out: false,
        }
    }

    pub fn plan_id(&self) -> &PlanId {
        &self.plan_id
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    pub async fn run(&mut self, cancel: &CancellationToken, state: &RunState) -> ExecResult<()> {
        let child = cancel.child_token();
        let mut run = self.step.run(&child, state);
        match tokio::time::timeout(self.duration, &mut run).await {
            Ok(result) => result,
            Err(_) => {
                child.cancel();
                match run.await {
                    Ok(()) | Err(ExecError::Cancelled) => {}
                    Err(err) => {
                        debug!(
                            plan_id = %self.plan_id,
                            error = %err,
                            "step failed while timing out"
                        );
                    }
                }
                self.timed_out = true;
                obs::emit_step_timed_out(&self.plan_id, self.duration.as_secs());
                Ok(())
            }
        }
    }

    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.step.succeeded()
    }
}
