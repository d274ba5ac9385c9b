//! Startup load of existing workloads

use super::WorkloadManager;
use crate::health::components;
use crate::runtime::Runtime;
use crate::util::with_timeout;
use tokio::task::JoinSet;
use tracing::{info, warn};

impl WorkloadManager {
    /// Report every owned workload once and start its log and metric tasks.
    ///
    /// Workloads are handled concurrently; one failing workload does not
    /// affect the others. Returns once all of them have been handled.
    pub(super) async fn initial_load(&self) {
        let ids = match with_timeout(
            "list_workload_ids",
            self.inner.config.runtime_timeout,
            self.inner.runtime.list_workload_ids(&self.inner.config.filter),
        )
        .await
        {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "Failed to list workloads at startup");
                self.inner
                    .health
                    .set_degraded(components::RUNTIME, e.to_string());
                return;
            }
        };
        self.inner.health.set_healthy(components::RUNTIME);
        self.inner.metrics.set_workloads_monitored(ids.len() as i64);
        info!(count = ids.len(), "Loading existing workloads");

        let mut tasks = JoinSet::new();
        for id in ids {
            let manager = self.clone();
            tasks.spawn(async move { manager.load_one(id).await });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Workload load task failed");
            }
        }
        info!("Existing workloads loaded");
    }

    async fn load_one(&self, id: String) {
        let status = match with_timeout(
            "get_status",
            self.inner.config.runtime_timeout,
            self.inner.runtime.get_status(&id, false),
        )
        .await
        {
            Ok(status) => status,
            Err(e) => {
                warn!(workload_id = %id, error = %e, "Skipping workload at startup");
                return;
            }
        };

        if status.running {
            self.spawn_attach(&id);
            self.spawn_metrics(&id);
        }
        let _ = self.push_status(status).await;
    }
}
