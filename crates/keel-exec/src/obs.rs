//! Structured observability hooks for step and fetch lifecycle events.
//!
//! Events are emitted at `info!` level (configurable via the `KEEL_LOG` env
//! var). For JSON output, initialise tracing with `LogFormat::Json`.

use tracing::{info, warn};

use keel_core::PlanId;

/// Span covering one step of one build.
pub fn step_span(build_id: i64, plan_id: &PlanId, name: &str) -> tracing::Span {
    tracing::info_span!("keel.step", build_id = build_id, plan_id = %plan_id, step = %name)
}

/// Emit event: a get step began resolving its resource.
pub fn emit_step_initializing(plan_id: &PlanId, name: &str, resource_type: &str) {
    info!(
        event = "step.initializing",
        plan_id = %plan_id,
        step = %name,
        resource_type = %resource_type,
    );
}

/// Emit event: a worker was chosen for a step.
pub fn emit_worker_selected(plan_id: &PlanId, worker: &str) {
    info!(event = "step.worker_selected", plan_id = %plan_id, worker = %worker);
}

/// Emit event: a fetch found an initialised cache volume.
pub fn emit_fetch_cache_hit(lock_name: &str, worker: &str, volume: &str) {
    info!(
        event = "fetch.cache_hit",
        lock_name = %lock_name,
        worker = %worker,
        volume = %volume,
    );
}

/// Emit event: a fetch is waiting for another holder of its lock.
pub fn emit_fetch_lock_waiting(lock_name: &str, worker: &str) {
    info!(event = "fetch.lock_waiting", lock_name = %lock_name, worker = %worker);
}

/// Emit event: a fetch ran the resource's `in` script.
pub fn emit_fetch_script_finished(lock_name: &str, worker: &str, exit_status: i32) {
    info!(
        event = "fetch.script_finished",
        lock_name = %lock_name,
        worker = %worker,
        exit_status = exit_status,
    );
}

/// Emit event: an artifact was registered for later steps.
pub fn emit_artifact_registered(name: &str, replaced: bool) {
    info!(event = "artifact.registered", name = %name, replaced = replaced);
}

/// Emit event: a step ran to completion.
pub fn emit_step_finished(plan_id: &PlanId, exit_status: i32, succeeded: bool) {
    info!(
        event = "step.finished",
        plan_id = %plan_id,
        exit_status = exit_status,
        succeeded = succeeded,
    );
}

/// Emit event: a step failed with an infrastructure error (warning level).
pub fn emit_step_errored(plan_id: &PlanId, error: &dyn std::fmt::Display) {
    warn!(event = "step.errored", plan_id = %plan_id, error = %error);
}

/// Emit event: a timeout step's deadline passed.
pub fn emit_step_timed_out(plan_id: &PlanId, duration_secs: u64) {
    warn!(event = "step.timed_out", plan_id = %plan_id, duration_secs = duration_secs);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emitters_do_not_panic_without_subscriber() {
        let plan_id = PlanId::new("1");
        let _span = step_span(42, &plan_id, "repo").entered();
        emit_step_initializing(&plan_id, "repo", "git");
        emit_fetch_lock_waiting("abc", "w");
        emit_step_finished(&plan_id, 0, true);
        emit_step_errored(&plan_id, &"boom");
    }
}
