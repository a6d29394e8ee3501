//! keel-state: pipeline store and cache contracts for keel
//!
//! The step engine never talks to a database directly. It reads builds,
//! pipelines and resources, records resource caches and takes fetch locks
//! through the traits in [`storage_traits`].
//!
//! ## Key Components
//!
//! - `Build` / `Pipeline` / `Resource`: pipeline store lookups
//! - `ResourceCacheFactory`: content-addressed `UsedResourceCache` records
//! - `LockFactory`: named fetch locks, with `InProcessLockFactory` as the
//!   single-process implementation
//! - `fakes`: in-memory implementations for tests and local runs

mod error;
pub mod fakes;
pub mod lock;
pub mod storage_traits;

pub use error::StorageError;
pub use lock::InProcessLockFactory;
pub use storage_traits::{
    Build, ContainerMetadata, ContainerOwner, ContainerType, Lock, LockFactory, LockId, Pipeline,
    Resource, ResourceCacheFactory, ResourceCacheUser, ResourceConfig, StorageResult,
    UsedResourceCache,
};
