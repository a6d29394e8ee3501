//! Per-build execution context.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use keel_core::PlanId;

use crate::artifact::ArtifactRepository;
use crate::delegate::VersionInfo;

/// State shared by every step of one build run.
///
/// Holds the build's artifacts and the results each step publishes for the
/// steps after it.
#[derive(Debug, Default)]
pub struct RunState {
    artifacts: ArtifactRepository,
    results: Mutex<HashMap<PlanId, VersionInfo>>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn artifacts(&self) -> &ArtifactRepository {
        &self.artifacts
    }

    pub fn store_result(&self, plan_id: PlanId, info: VersionInfo) {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(plan_id, info);
    }

    pub fn result(&self, plan_id: &PlanId) -> Option<VersionInfo> {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(plan_id)
            .cloned()
    }
}
