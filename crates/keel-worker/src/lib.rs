//! keel-worker: where steps run
//!
//! Contracts for workers, containers and volumes, the pool that places a
//! step's container on a compatible worker, and the streaming contracts
//! artifacts are read through.
//!
//! ## Key Components
//!
//! - `Worker` / `Container` / `Volume`: the runtime a fetch drives
//! - `Pool` + `ContainerPlacementStrategy`: worker selection
//! - `ArtifactSource` / `ArtifactDestination`: tar+gzip streaming
//! - `LocalWorker`: child-process runtime on the local machine
//! - `fakes`: in-memory implementations for tests

pub mod archive;
pub mod artifact;
mod error;
pub mod fakes;
pub mod local;
pub mod pool;
pub mod spec;
pub mod strategy;
pub mod worker;

pub use archive::FileStream;
pub use artifact::{ArtifactDestination, ArtifactSource, DirectoryDestination, VolumeDestination};
pub use error::{ArtifactError, WorkerError, WorkerResult};
pub use local::{LocalVolume, LocalWorker};
pub use pool::{Pool, WorkerPool, WorkerProvider};
pub use spec::{ContainerLimits, ContainerSpec, ImageSpec, WorkerSpec};
pub use strategy::{
    ContainerPlacementStrategy, FewestBuildContainers, MostAvailableVolumeSpace,
    PlacementStrategyKind,
};
pub use worker::{
    satisfies, ByteStream, Container, GetOutcome, GetRequest, GetResponse, NullOutput,
    OutputStream, ProcessOutput, Volume, Worker,
};
