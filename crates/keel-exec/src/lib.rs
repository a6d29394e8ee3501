//! keel-exec: build step execution and resource fetching.
//!
//! A build's plan becomes a tree of [`Step`]s via [`StepFactory`]. Get steps
//! resolve their resource, pick a worker through the worker pool, fetch the
//! version with a [`Fetcher`] and register the result as an artifact in the
//! build's [`RunState`].

pub mod artifact;
pub mod config;
pub mod delegate;
mod error;
pub mod factory;
pub mod fakes;
pub mod obs;
pub mod resource;
pub mod run_state;
pub mod step;
pub mod step_metadata;

pub use artifact::{ArtifactName, ArtifactRepository};
pub use config::{EngineConfig, DEFAULT_GET_WORKING_DIRECTORY, DEFAULT_LOCK_POLL_INTERVAL};
pub use delegate::{
    DelegateFactory, ExitStatus, GetDelegate, GetEventHandler, LoggingGetDelegate, Origin,
    VersionInfo,
};
pub use error::{ExecError, ExecResult, FetchError};
pub use factory::StepFactory;
pub use resource::{
    lock_name, FetchRequest, FetchSession, Fetcher, ResourceFetcher, ResourceInstance,
};
pub use run_state::RunState;
pub use step::{
    AggregateStep, GetArtifactSource, GetStep, OnSuccessStep, RetryStep, SequenceStep, Step,
    TimeoutStep,
};
pub use step_metadata::{BuildStepMetadata, StepMetadata};
