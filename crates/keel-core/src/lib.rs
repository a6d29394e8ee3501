//! keel core types
//!
//! Value types shared by every layer of the step engine:
//! - build plans ([`Plan`], [`GetPlan`])
//! - resource identity pieces ([`Version`], [`Source`], [`Space`], custom
//!   resource types)
//! - `((var))` credential interpolation ([`creds`])
//! - canonical JSON and SHA-256 digests ([`digest`])

pub mod creds;
pub mod digest;
pub mod error;
pub mod plan;
pub mod resource;
pub mod telemetry;

pub use creds::{StaticVariables, StaticVariablesFactory, Variables, VariablesFactory};
pub use digest::{canonical_json, compute_digest, sha256_hex, to_go_json};
pub use error::{CoreError, CredsError, Result};
pub use plan::{GetPlan, OnSuccessPlan, Plan, PlanId, PlanKind, TimeoutPlan};
pub use resource::{
    Metadata, MetadataField, Params, ResourceType, Source, Space, Tags, Version,
    VersionedResourceType, VersionedResourceTypes,
};
pub use telemetry::{init_tracing, LogFormat};

/// keel version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
