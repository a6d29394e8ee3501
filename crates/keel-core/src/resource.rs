//! Resource value types shared by plans, the pipeline store and workers.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// A concrete resource version, e.g. `{"ref": "abc123"}`.
///
/// Keys are kept sorted so every serialization of a version is identical.
pub type Version = BTreeMap<String, String>;

/// Resource source configuration (credentials already interpolated once it
/// reaches a worker).
pub type Source = BTreeMap<String, serde_json::Value>;

/// Parameters passed to a resource script.
pub type Params = BTreeMap<String, serde_json::Value>;

/// Worker tags requested by a step.
pub type Tags = Vec<String>;

/// Version metadata reported by a resource script.
pub type Metadata = Vec<MetadataField>;

/// A sub-namespace of versions for a resource (e.g. a branch).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Space(pub String);

impl Space {
    pub fn new(space: impl Into<String>) -> Self {
        Space(space.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Space {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Space {
    fn from(s: &str) -> Self {
        Space(s.to_string())
    }
}

/// One `name: value` pair of version metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataField {
    pub name: String,
    pub value: String,
}

impl MetadataField {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A custom resource type declared by a pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceType {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub source: Source,
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub tags: Tags,
}

/// A custom resource type pinned at the version the build will use.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionedResourceType {
    #[serde(flatten)]
    pub resource_type: ResourceType,
    #[serde(default)]
    pub version: Version,
}

/// The set of custom resource types visible to a step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionedResourceTypes(pub Vec<VersionedResourceType>);

impl VersionedResourceTypes {
    pub fn new(types: Vec<VersionedResourceType>) -> Self {
        Self(types)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VersionedResourceType> {
        self.0.iter()
    }

    /// Find a custom type by name.
    pub fn lookup(&self, name: &str) -> Option<&VersionedResourceType> {
        self.0.iter().find(|t| t.resource_type.name == name)
    }

    /// The set without the named type. A custom type may shadow a base type
    /// of the same name, so its own image is resolved against the rest.
    pub fn without(&self, name: &str) -> Self {
        Self(
            self.0
                .iter()
                .filter(|t| t.resource_type.name != name)
                .cloned()
                .collect(),
        )
    }

    /// Follow custom types down to the base type a worker must provide.
    ///
    /// Each custom type is visited at most once, so cyclic declarations
    /// terminate at the first repeated name.
    pub fn base_type<'a>(&'a self, type_name: &'a str) -> &'a str {
        let mut seen = HashSet::new();
        let mut current = type_name;
        while let Some(custom) = self.lookup(current) {
            if !seen.insert(current) {
                break;
            }
            current = custom.resource_type.type_.as_str();
        }
        current
    }
}

impl FromIterator<VersionedResourceType> for VersionedResourceTypes {
    fn from_iter<I: IntoIterator<Item = VersionedResourceType>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
