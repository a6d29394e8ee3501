//! Identity of one resource fetch.

use serde::Serialize;

use keel_core::{sha256_hex, Params, Source, Space, Version, VersionedResourceTypes};
use keel_state::{ContainerOwner, UsedResourceCache};

/// A resource fetch: what to fetch, with which (already interpolated)
/// configuration, into which cache, for which container owner.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceInstance {
    resource_type: String,
    space: Space,
    version: Version,
    source: Source,
    params: Params,
    resource_types: VersionedResourceTypes,
    cache: UsedResourceCache,
    owner: ContainerOwner,
}

/// Fields hashed into a lock name, in their serialized order.
#[derive(Serialize)]
struct LockKey<'a> {
    #[serde(rename = "type")]
    resource_type: &'a str,
    space: &'a Space,
    version: &'a Version,
    source: &'a Source,
    params: &'a Params,
    worker_name: &'a str,
}

impl ResourceInstance {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        resource_type: impl Into<String>,
        space: Space,
        version: Version,
        source: Source,
        params: Params,
        resource_types: VersionedResourceTypes,
        cache: UsedResourceCache,
        owner: ContainerOwner,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            space,
            version,
            source,
            params,
            resource_types,
            cache,
            owner,
        }
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn space(&self) -> &Space {
        &self.space
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn resource_types(&self) -> &VersionedResourceTypes {
        &self.resource_types
    }

    pub fn resource_cache(&self) -> &UsedResourceCache {
        &self.cache
    }

    pub fn container_owner(&self) -> &ContainerOwner {
        &self.owner
    }

    /// Name of the lock serializing fetches of this signature on
    /// `worker_name`.
    ///
    /// Hex SHA-256 of `{"type","space","version","source","params",
    /// "worker_name"}` encoded the way Go's `json.Marshal` encodes it, so
    /// names agree with locks taken by other implementations.
    pub fn lock_name(&self, worker_name: &str) -> keel_core::Result<String> {
        lock_name(
            &self.resource_type,
            &self.space,
            &self.version,
            &self.source,
            &self.params,
            worker_name,
        )
    }
}

/// Lock name of a fetch signature on a worker. See
/// [`ResourceInstance::lock_name`].
pub fn lock_name(
    resource_type: &str,
    space: &Space,
    version: &Version,
    source: &Source,
    params: &Params,
    worker_name: &str,
) -> keel_core::Result<String> {
    let key = LockKey {
        resource_type,
        space,
        version,
        source,
        params,
        worker_name,
    };
    let json = keel_core::to_go_json(&key)?;
    Ok(sha256_hex(json.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use keel_core::PlanId;
    use keel_state::ResourceConfig;
    use serde_json::json;

    fn cache() -> UsedResourceCache {
        UsedResourceCache {
            id: 1,
            resource_config: ResourceConfig {
                id: 1,
                resource_type: "some-resource-type".into(),
                base_resource_type: "some-resource-type".into(),
                source_hash: String::new(),
            },
            version: Version::new(),
            params_hash: String::new(),
            created_at: Utc::now(),
        }
    }

    fn instance() -> ResourceInstance {
        ResourceInstance::new(
            "some-resource-type",
            Space::new("space"),
            [("some-version".to_string(), "some-value".to_string())].into(),
            [("some".to_string(), json!("super-secret-source"))].into(),
            [("some-param".to_string(), json!("some-value"))].into(),
            VersionedResourceTypes::default(),
            cache(),
            ContainerOwner::build_step(42, PlanId::new("56"), 123),
        )
    }

    #[test]
    fn lock_name_matches_reference_digest() {
        let reference = r#"{"type":"some-resource-type","space":"space","version":{"some-version":"some-value"},"source":{"some":"super-secret-source"},"params":{"some-param":"some-value"},"worker_name":"fake-worker"}"#;
        assert_eq!(
            instance().lock_name("fake-worker").unwrap(),
            sha256_hex(reference.as_bytes())
        );
    }

    #[test]
    fn lock_name_is_deterministic_and_worker_scoped() {
        let a = instance().lock_name("worker-a").unwrap();
        assert_eq!(a, instance().lock_name("worker-a").unwrap());
        assert_ne!(a, instance().lock_name("worker-b").unwrap());
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn lock_name_ignores_cache_and_owner() {
        let mut other = instance();
        other.owner = ContainerOwner::build_step(1, PlanId::new("2"), 3);
        other.cache.id = 99;
        assert_eq!(
            other.lock_name("w").unwrap(),
            instance().lock_name("w").unwrap()
        );
    }

    #[test]
    fn empty_maps_serialize_as_objects() {
        let bare = ResourceInstance::new(
            "git",
            Space::default(),
            Version::new(),
            Source::new(),
            Params::new(),
            VersionedResourceTypes::default(),
            cache(),
            ContainerOwner::build_step(1, PlanId::new("1"), 1),
        );
        let reference =
            r#"{"type":"git","space":"","version":{},"source":{},"params":{},"worker_name":"w"}"#;
        assert_eq!(
            bare.lock_name("w").unwrap(),
            sha256_hex(reference.as_bytes())
        );
    }
}
