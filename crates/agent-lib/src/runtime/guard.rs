//! Single-probe-per-workload guard around any runtime

use super::{AttachedStreams, EventStream, Runtime};
use crate::error::{AgentError, Result};
use crate::models::{WorkloadFilter, WorkloadStatus};
use crate::util::KeyedLock;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Wraps a runtime so at most one health probe per workload is in flight.
///
/// A second `get_status(id, true)` for an ID already being probed fails
/// immediately with [`AgentError::LockFailed`].
pub struct GuardedRuntime {
    inner: Arc<dyn Runtime>,
    probes: KeyedLock,
}

impl GuardedRuntime {
    pub fn new(inner: Arc<dyn Runtime>) -> Self {
        Self {
            inner,
            probes: KeyedLock::new(),
        }
    }

    /// Number of probes currently in flight
    pub fn probes_in_flight(&self) -> usize {
        self.probes.len()
    }
}

#[async_trait]
impl Runtime for GuardedRuntime {
    async fn list_workload_ids(&self, filter: &WorkloadFilter) -> Result<Vec<String>> {
        self.inner.list_workload_ids(filter).await
    }

    async fn get_status(&self, id: &str, check_health: bool) -> Result<WorkloadStatus> {
        if !check_health {
            return self.inner.get_status(id, false).await;
        }
        let _guard = self
            .probes
            .try_acquire(id)
            .ok_or_else(|| AgentError::LockFailed(id.to_string()))?;
        self.inner.get_status(id, true).await
    }

    async fn attach_workload(&self, id: &str) -> Result<AttachedStreams> {
        self.inner.attach_workload(id).await
    }

    async fn events(
        &self,
        filter: &WorkloadFilter,
        token: CancellationToken,
    ) -> Result<EventStream> {
        self.inner.events(filter, token).await
    }

    async fn collect_workload_metrics(&self, token: CancellationToken, id: &str) {
        self.inner.collect_workload_metrics(token, id).await
    }

    async fn get_workload_name(&self, id: &str) -> Result<String> {
        self.inner.get_workload_name(id).await
    }

    async fn log_fields_extra(&self, id: &str) -> Result<HashMap<String, String>> {
        self.inner.log_fields_extra(id).await
    }

    async fn is_daemon_running(&self) -> bool {
        self.inner.is_daemon_running().await
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
