//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use keel_worker::{ContainerLimits, PlacementStrategyKind};

/// Default working directory of a get step's container.
pub const DEFAULT_GET_WORKING_DIRECTORY: &str = "/tmp/build/get";

/// Default pause between attempts to take a busy fetch lock.
pub const DEFAULT_LOCK_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Tunables shared by every step a factory creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Milliseconds between attempts to take a busy fetch lock.
    pub lock_poll_interval_ms: u64,
    /// Working directory recorded in a get container's metadata.
    pub get_working_directory: String,
    pub placement_strategy: PlacementStrategyKind,
    pub container_limits: ContainerLimits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_poll_interval_ms: DEFAULT_LOCK_POLL_INTERVAL.as_millis() as u64,
            get_working_directory: DEFAULT_GET_WORKING_DIRECTORY.to_string(),
            placement_strategy: PlacementStrategyKind::default(),
            container_limits: ContainerLimits::default(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }

    pub fn with_lock_poll_interval(mut self, interval: Duration) -> Self {
        self.lock_poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_get_working_directory(mut self, dir: impl Into<String>) -> Self {
        self.get_working_directory = dir.into();
        self
    }

    pub fn with_placement_strategy(mut self, strategy: PlacementStrategyKind) -> Self {
        self.placement_strategy = strategy;
        self
    }

    pub fn with_container_limits(mut self, limits: ContainerLimits) -> Self {
        self.container_limits = limits;
        self
    }
}
