//! Build plans: the serialisable tree a build's steps are created from.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::resource::{Params, Source, Space, Tags, Version, VersionedResourceTypes};

/// Identifier of one node in a build plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(pub String);

impl PlanId {
    pub fn new(id: impl Into<String>) -> Self {
        PlanId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for PlanId {
    fn from(id: u64) -> Self {
        PlanId(id.to_string())
    }
}

/// A node of the build plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    #[serde(flatten)]
    pub kind: PlanKind,
}

/// What a plan node does. Composite kinds own their children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    Get(GetPlan),
    Aggregate(Vec<Plan>),
    Do(Vec<Plan>),
    OnSuccess(OnSuccessPlan),
    Retry(Vec<Plan>),
    Timeout(TimeoutPlan),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnSuccessPlan {
    pub step: Box<Plan>,
    pub next: Box<Plan>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutPlan {
    pub duration_secs: u64,
    pub step: Box<Plan>,
}

/// Fetch one version of a resource and register it as an artifact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetPlan {
    /// Artifact name the fetched bits are registered under.
    pub name: String,
    /// Pipeline resource name; empty for an anonymous resource.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource: String,
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub space: Space,
    #[serde(default)]
    pub source: Source,
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
    /// Take the version stored by an earlier step of the same build.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_from: Option<PlanId>,
    #[serde(default, rename = "resource_types")]
    pub versioned_resource_types: VersionedResourceTypes,
}

impl GetPlan {
    /// Whether the plan names a pipeline resource.
    pub fn is_pipeline_resource(&self) -> bool {
        !self.resource.is_empty()
    }
}

impl Plan {
    pub fn new(id: impl Into<PlanId>, kind: PlanKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }

    pub fn get(id: impl Into<PlanId>, plan: GetPlan) -> Self {
        Self::new(id, PlanKind::Get(plan))
    }
}

impl From<&str> for PlanId {
    fn from(s: &str) -> Self {
        PlanId(s.to_string())
    }
}
