//! How a step reports its progress to the outside world.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use keel_core::{Metadata, PlanId, Version};
use keel_worker::{OutputStream, ProcessOutput};

/// Exit status of a resource script.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExitStatus(pub i32);

impl ExitStatus {
    pub fn success(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a get step produced: the version fetched and, for pipeline
/// resources, the metadata recorded for it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

/// Where a line of script output came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Origin {
    pub plan_id: PlanId,
    pub name: String,
    pub stream: OutputStream,
}

/// Receives lifecycle events of one get step.
///
/// `finished` is called once for a fetch that ran to completion (including a
/// non-zero script exit) and never for an infrastructure failure.
pub trait GetDelegate: Send + Sync {
    fn initializing(&self);
    fn starting(&self);
    fn finished(&self, status: ExitStatus, info: &VersionInfo);
    fn output(&self, origin: &Origin, chunk: &str);
}

/// Creates the delegate for each get step of a build.
pub trait DelegateFactory: Send + Sync {
    fn get_delegate(&self, plan_id: &PlanId, name: &str) -> Arc<dyn GetDelegate>;
}

impl<F> DelegateFactory for F
where
    F: Fn(&PlanId, &str) -> Arc<dyn GetDelegate> + Send + Sync,
{
    fn get_delegate(&self, plan_id: &PlanId, name: &str) -> Arc<dyn GetDelegate> {
        self(plan_id, name)
    }
}

/// Forwards script output to a step's delegate, tagged with its origin.
#[derive(Clone)]
pub struct GetEventHandler {
    delegate: Arc<dyn GetDelegate>,
    plan_id: PlanId,
    name: String,
}

impl GetEventHandler {
    pub fn new(delegate: Arc<dyn GetDelegate>, plan_id: PlanId, name: impl Into<String>) -> Self {
        Self {
            delegate,
            plan_id,
            name: name.into(),
        }
    }
}

impl fmt::Debug for GetEventHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GetEventHandler")
            .field("plan_id", &self.plan_id)
            .field("name", &self.name)
            .finish()
    }
}

impl ProcessOutput for GetEventHandler {
    fn write(&self, stream: OutputStream, chunk: &str) {
        let origin = Origin {
            plan_id: self.plan_id.clone(),
            name: self.name.clone(),
            stream,
        };
        self.delegate.output(&origin, chunk);
    }
}

/// Delegate that reports through `tracing`.
#[derive(Debug, Clone, Default)]
pub struct LoggingGetDelegate {
    plan_id: PlanId,
    name: String,
}

impl LoggingGetDelegate {
    pub fn new(plan_id: PlanId, name: impl Into<String>) -> Self {
        Self {
            plan_id,
            name: name.into(),
        }
    }

    /// A [`DelegateFactory`] handing out logging delegates.
    pub fn factory() -> impl DelegateFactory {
        |plan_id: &PlanId, name: &str| -> Arc<dyn GetDelegate> {
            Arc::new(LoggingGetDelegate::new(plan_id.clone(), name))
        }
    }
}

impl GetDelegate for LoggingGetDelegate {
    fn initializing(&self) {
        info!(event = "get.initializing", plan_id = %self.plan_id, step = %self.name);
    }

    fn starting(&self) {
        info!(event = "get.starting", plan_id = %self.plan_id, step = %self.name);
    }

    fn finished(&self, status: ExitStatus, info: &VersionInfo) {
        let version = serde_json::to_string(&info.version).unwrap_or_default();
        info!(
            event = "get.finished",
            plan_id = %self.plan_id,
            step = %self.name,
            exit_status = status.0,
            version = %version,
        );
    }

    fn output(&self, origin: &Origin, chunk: &str) {
        info!(
            event = "get.output",
            plan_id = %origin.plan_id,
            step = %origin.name,
            stream = ?origin.stream,
            "{}",
            chunk.trim_end()
        );
    }
}
