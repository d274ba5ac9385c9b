//! Periodic health sweep and start-time health re-checks

use super::WorkloadManager;
use crate::error::{AgentError, Result};
use crate::health::components;
use crate::logs::LogTarget;
use crate::runtime::Runtime;
use crate::util::{with_timeout, WorkerPool};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

impl WorkloadManager {
    /// Sweep every `check_interval` until `token` is cancelled
    pub(super) async fn health_check_loop(&self, token: CancellationToken) {
        let period = self.inner.config.check_interval;
        let pool = WorkerPool::new(
            self.inner.config.workers,
            self.inner.config.queue_capacity,
            token.child_token(),
            &self.inner.tracker,
        );
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.inner.health.set_healthy(components::HEALTH_CHECKER);
        info!(interval_secs = period.as_secs(), workers = pool.workers(), "Health checker started");

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => self.sweep(&pool).await,
            }
        }

        info!("Health checker stopped");
    }

    /// Queue one probe per owned workload
    pub(super) async fn sweep(&self, pool: &WorkerPool) {
        let ids = match with_timeout(
            "list_workload_ids",
            self.inner.config.runtime_timeout,
            self.inner.runtime.list_workload_ids(&self.inner.config.filter),
        )
        .await
        {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "Health sweep could not list workloads");
                self.inner
                    .health
                    .set_degraded(components::RUNTIME, e.to_string());
                return;
            }
        };
        self.inner.health.set_healthy(components::RUNTIME);
        self.inner.metrics.set_workloads_monitored(ids.len() as i64);
        let pruned = self.inner.store.prune_expired();
        debug!(count = ids.len(), pruned, "Health sweep");

        for id in ids {
            let manager = self.clone();
            let submitted = pool
                .submit(async move {
                    if let Err(e) = manager.check_one(&id).await {
                        debug!(workload_id = %id, error = %e, "Health check failed");
                    }
                })
                .await;
            if let Err(e) = submitted {
                self.inner
                    .health
                    .set_degraded(components::HEALTH_CHECKER, e.to_string());
                return;
            }
        }
        self.inner.health.set_healthy(components::HEALTH_CHECKER);

        let writer = &self.inner.writer;
        if *writer.target() == LogTarget::Discard || writer.is_connected().await {
            self.inner.health.set_healthy(components::LOG_FORWARDER);
        } else {
            self.inner
                .health
                .set_degraded(components::LOG_FORWARDER, format!("{:?} not connected", writer.target()));
            writer.connect();
        }
    }

    /// Probe one workload and push its status. Returns its health.
    ///
    /// A probe already in flight for `id` makes this a silent no-op.
    pub(super) async fn check_one(&self, id: &str) -> Result<bool> {
        let status = match self.probe_status(id).await {
            Ok(status) => status,
            Err(AgentError::LockFailed(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        let healthy = status.healthy;
        self.push_status(status).await?;
        Ok(healthy)
    }

    /// Re-check `id` with backoff until it is healthy, stops running or
    /// the attempts run out
    pub(super) fn spawn_check_until_healthy(&self, id: &str) {
        let manager = self.clone();
        let token = self.inner.shutdown.child_token();
        let id = id.to_string();
        self.inner
            .tracker
            .spawn(async move { manager.check_until_healthy(&id, &token).await });
    }

    async fn check_until_healthy(&self, id: &str, token: &CancellationToken) {
        // `None` means "probed and pushed, still unhealthy".
        let result: std::result::Result<(), Option<AgentError>> = self
            .inner
            .config
            .health_retry
            .retry_if(
                token,
                |_| async move {
                    let status = self.probe_status(id).await.map_err(Some)?;
                    let settled = !status.running || status.healthy;
                    self.push_status(status).await.map_err(Some)?;
                    if settled {
                        Ok(())
                    } else {
                        Err(None)
                    }
                },
                |e| !matches!(e, Some(AgentError::NotFound(_)) | Some(AgentError::Invalid(_))),
            )
            .await;

        match result {
            Ok(()) => debug!(workload_id = %id, "Health re-check finished"),
            Err(None) => info!(workload_id = %id, "Workload did not become healthy, giving up"),
            Err(Some(e)) => warn!(workload_id = %id, error = %e, "Health re-check abandoned"),
        }
    }
}
