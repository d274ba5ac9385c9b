//! Runtime capability contract
//!
//! Every execution backend (container engine, hypervisor) is driven through
//! the [`Runtime`] trait. Calls are plain blocking-per-call async operations;
//! callers layer timeouts and concurrency on top.

mod guard;
pub mod mock;
pub mod probe;


pub use guard::GuardedRuntime;
pub use mock::{MockRuntime, MockWorkload};
pub use probe::HealthCheck;

use crate::error::{AgentError, Result};
use crate::models::{WorkloadEventMessage, WorkloadFilter, WorkloadStatus};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

pub use async_trait::async_trait;

/// Boxed byte stream of workload output
pub type OutputStream = Box<dyn AsyncRead + Send + Unpin>;

/// Live stdout/stderr of an attached workload
pub struct AttachedStreams {
    pub stdout: OutputStream,
    pub stderr: OutputStream,
}

/// Subscription to a runtime's change events.
///
/// `errors` yields at most one terminal error; afterwards both channels close.
pub struct EventStream {
    pub events: mpsc::Receiver<WorkloadEventMessage>,
    pub errors: oneshot::Receiver<AgentError>,
}

/// Capability set every runtime driver implements
#[async_trait]
pub trait Runtime: Send + Sync {
    /// IDs of all matching workloads, running and stopped
    async fn list_workload_ids(&self, filter: &WorkloadFilter) -> Result<Vec<String>>;

    /// Current status. With `check_health` and a running workload this probes
    async fn get_status(&self, id: &str, check_health: bool) -> Result<WorkloadStatus>;

    /// Open the workload's output streams
    async fn attach_workload(&self, id: &str) -> Result<AttachedStreams>;

    /// Subscribe to change events until `token` is cancelled
    async fn events(&self, filter: &WorkloadFilter, token: CancellationToken)
        -> Result<EventStream>;

    /// Sample resource usage until `token` is cancelled. No-op when unsupported
    async fn collect_workload_metrics(&self, token: CancellationToken, id: &str);

    async fn get_workload_name(&self, id: &str) -> Result<String>;

    /// Extra key/values attached to every log record of this workload
    async fn log_fields_extra(&self, id: &str) -> Result<HashMap<String, String>>;

    async fn is_daemon_running(&self) -> bool;

    fn name(&self) -> &str;
}

/// Supported runtime backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Docker,
    Yavirt,
    Mock,
}

/// Runtime selection and connection settings
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub kind: RuntimeKind,
    /// Backend endpoint, e.g. `unix:///var/run/docker.sock`
    pub endpoint: String,
    /// Node name stamped on statuses
    pub nodename: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            kind: RuntimeKind::Docker,
            endpoint: "unix:///var/run/docker.sock".to_string(),
            nodename: "localhost".to_string(),
        }
    }
}

/// Build the configured runtime. Selected once at startup
pub fn create_runtime(config: &RuntimeConfig) -> Result<Arc<dyn Runtime>> {
    match config.kind {
        RuntimeKind::Mock => {
            tracing::info!("Using in-memory mock runtime");
            Ok(Arc::new(MockRuntime::with_fixtures(&config.nodename)))
        }
        RuntimeKind::Docker => {
            tracing::error!(endpoint = %config.endpoint, "Docker driver is not built into this agent");
            Err(AgentError::NotImplemented("docker runtime driver"))
        }
        RuntimeKind::Yavirt => {
            tracing::error!(endpoint = %config.endpoint, "Yavirt driver is not built into this agent");
            Err(AgentError::NotImplemented("yavirt runtime driver"))
        }
    }
}

/// Split an `app_entrypoint_ident` workload name
pub fn parse_workload_name(name: &str) -> Result<(String, String, String)> {
    let trimmed = name.trim_start_matches('/');
    let parts: Vec<&str> = trimmed.split('_').collect();
    match parts.as_slice() {
        [app, entrypoint, ident] if !app.is_empty() && !entrypoint.is_empty() => {
            Ok((app.to_string(), entrypoint.to_string(), ident.to_string()))
        }
        _ => Err(AgentError::Invalid(name.to_string())),
    }
}
