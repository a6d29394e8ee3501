//! What a step asks of a worker: the container it needs and the
//! constraints the worker must meet.

use serde::{Deserialize, Serialize};

use keel_core::{Tags, VersionedResourceTypes};

/// Image a container runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSpec {
    /// Resource type whose image provides the scripts.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default)]
    pub privileged: bool,
}

impl ImageSpec {
    pub fn for_resource_type(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            ..Default::default()
        }
    }
}

/// Resource limits applied to a container. `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<u64>,
}

/// The container a step needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub image_spec: ImageSpec,
    pub team_id: i32,
    /// `KEY=value` pairs.
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub limits: ContainerLimits,
}

/// Constraints on the worker a step may run on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub resource_type: String,
    #[serde(default)]
    pub tags: Tags,
    pub team_id: i32,
    #[serde(default)]
    pub resource_types: VersionedResourceTypes,
}
