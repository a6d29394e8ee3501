//! Container placement strategies.
//!
//! A strategy picks one worker out of those that already satisfy a step's
//! worker spec. Ties are broken by worker name so placement is
//! deterministic.

use std::cmp::Reverse;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{WorkerError, WorkerResult};
use crate::spec::ContainerSpec;
use crate::worker::Worker;

/// Chooses a worker for a new container.
pub trait ContainerPlacementStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn choose(
        &self,
        workers: &[Arc<dyn Worker>],
        spec: &ContainerSpec,
    ) -> WorkerResult<Arc<dyn Worker>>;
}

/// Prefer the worker running the fewest containers.
#[derive(Debug, Clone, Copy, Default)]
pub struct FewestBuildContainers;

impl ContainerPlacementStrategy for FewestBuildContainers {
    fn name(&self) -> &'static str {
        "fewest-build-containers"
    }

    fn choose(
        &self,
        workers: &[Arc<dyn Worker>],
        _spec: &ContainerSpec,
    ) -> WorkerResult<Arc<dyn Worker>> {
        workers
            .iter()
            .min_by(|a, b| {
                (a.active_containers(), a.name()).cmp(&(b.active_containers(), b.name()))
            })
            .cloned()
            .ok_or_else(|| WorkerError::Strategy("no candidate workers".to_string()))
    }
}

/// Prefer the worker with the most free volume space.
#[derive(Debug, Clone, Copy, Default)]
pub struct MostAvailableVolumeSpace;

impl ContainerPlacementStrategy for MostAvailableVolumeSpace {
    fn name(&self) -> &'static str {
        "most-available-volume-space"
    }

    fn choose(
        &self,
        workers: &[Arc<dyn Worker>],
        _spec: &ContainerSpec,
    ) -> WorkerResult<Arc<dyn Worker>> {
        workers
            .iter()
            .min_by(|a, b| {
                (Reverse(a.available_volume_space()), a.name())
                    .cmp(&(Reverse(b.available_volume_space()), b.name()))
            })
            .cloned()
            .ok_or_else(|| WorkerError::Strategy("no candidate workers".to_string()))
    }
}

/// Configurable choice of placement strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlacementStrategyKind {
    #[default]
    FewestBuildContainers,
    MostAvailableVolumeSpace,
}

impl PlacementStrategyKind {
    pub fn strategy(self) -> Arc<dyn ContainerPlacementStrategy> {
        match self {
            PlacementStrategyKind::FewestBuildContainers => Arc::new(FewestBuildContainers),
            PlacementStrategyKind::MostAvailableVolumeSpace => Arc::new(MostAvailableVolumeSpace),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PlacementStrategyKind::FewestBuildContainers => "fewest-build-containers",
            PlacementStrategyKind::MostAvailableVolumeSpace => "most-available-volume-space",
        }
    }
}

impl fmt::Display for PlacementStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlacementStrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fewest-build-containers" => Ok(PlacementStrategyKind::FewestBuildContainers),
            "most-available-volume-space" => Ok(PlacementStrategyKind::MostAvailableVolumeSpace),
            other => Err(format!("unknown container placement strategy: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::MemoryWorker;

    fn worker(name: &str, containers: usize, space: u64) -> Arc<dyn Worker> {
        Arc::new(
            MemoryWorker::new(name)
                .with_active_containers(containers)
                .with_available_volume_space(space),
        )
    }

    #[test]
    fn fewest_build_containers_picks_least_loaded() {
        let workers = vec![worker("a", 3, 0), worker("b", 1, 0), worker("c", 2, 0)];
        let chosen = FewestBuildContainers
            .choose(&workers, &ContainerSpec::default())
            .unwrap();
        assert_eq!(chosen.name(), "b");
    }

    #[test]
    fn fewest_build_containers_breaks_ties_by_name() {
        let workers = vec![worker("zeta", 1, 0), worker("alpha", 1, 0)];
        let chosen = FewestBuildContainers
            .choose(&workers, &ContainerSpec::default())
            .unwrap();
        assert_eq!(chosen.name(), "alpha");
    }

    #[test]
    fn most_available_volume_space_picks_emptiest() {
        let workers = vec![worker("a", 0, 10), worker("b", 0, 30), worker("c", 0, 30)];
        let chosen = MostAvailableVolumeSpace
            .choose(&workers, &ContainerSpec::default())
            .unwrap();
        assert_eq!(chosen.name(), "b");
    }

    #[test]
    fn empty_candidates_is_a_strategy_error() {
        let err = FewestBuildContainers
            .choose(&[], &ContainerSpec::default())
            .unwrap_err();
        assert!(matches!(err, WorkerError::Strategy(_)));
    }

    #[test]
    fn kind_parses_and_displays() {
        let kind: PlacementStrategyKind = "most-available-volume-space".parse().unwrap();
        assert_eq!(kind, PlacementStrategyKind::MostAvailableVolumeSpace);
        assert_eq!(kind.to_string(), "most-available-volume-space");
        assert_eq!(kind.strategy().name(), "most-available-volume-space");
        assert!("random".parse::<PlacementStrategyKind>().is_err());
    }
}
