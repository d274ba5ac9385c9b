//! Workload lifecycle reconciliation
//!
//! The [`WorkloadManager`] keeps the control plane's view of this host's
//! workloads in line with the runtime. Three sources feed it:
//! - the bootstrap load at startup ([`bootstrap`])
//! - runtime events ([`monitor`])
//! - periodic health sweeps ([`healthcheck`])
//!
//! Every status write goes through [`WorkloadManager::push_status`].

mod bootstrap;
mod healthcheck;
pub mod monitor;

#[cfg(test)]
mod tests;

pub use monitor::{EventHandlers, EventMonitor, Handler, HandlerFuture};

use crate::error::{AgentError, Result};
use crate::health::{components, HealthRegistry};
use crate::logs::{LogAttacher, LogBroadcaster, LogSink, LogWriter, LogWriterConfig};
use crate::models::{actions, WorkloadEventMessage, WorkloadFilter, WorkloadStatus, OWNER_LABEL};
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::runtime::{create_runtime, EventStream, GuardedRuntime, Runtime, RuntimeConfig};
use crate::store::{create_store, CachedStore, Store, StoreConfig};
use crate::util::{with_timeout, KeyedLock, RetryPolicy};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Reconciliation settings
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub nodename: String,
    pub runtime: RuntimeConfig,
    pub store: StoreConfig,
    /// Ownership filter for listing and events
    pub filter: WorkloadFilter,
    /// Period of the full health sweep
    pub check_interval: Duration,
    /// Bound on one `get_status` call, probe included
    pub check_timeout: Duration,
    /// Bound on other runtime calls
    pub runtime_timeout: Duration,
    /// Bound on one store write
    pub store_timeout: Duration,
    /// TTL attached to pushed statuses; 0 means no expiry
    pub status_ttl: i64,
    /// How long an unchanged zero-TTL snapshot is suppressed; 0 disables
    pub cache_ttl: Duration,
    pub workers: usize,
    pub queue_capacity: usize,
    /// Retry of transient store failures
    pub push_retry: RetryPolicy,
    /// Re-check of a started but not yet healthy workload
    pub health_retry: RetryPolicy,
    /// Forwarder address (`udp://`, `tcp://`, `journal://` or `__discard__`)
    pub log_forwards: String,
    pub log_writer: LogWriterConfig,
    pub log_buffer: usize,
    pub subscriber_buffer: usize,
    pub collect_metrics: bool,
    pub shutdown_grace: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            nodename: "localhost".to_string(),
            runtime: RuntimeConfig::default(),
            store: StoreConfig::default(),
            filter: WorkloadFilter::new().label(OWNER_LABEL, "1"),
            check_interval: Duration::from_secs(15),
            check_timeout: Duration::from_secs(10),
            runtime_timeout: Duration::from_secs(10),
            store_timeout: Duration::from_secs(10),
            status_ttl: 0,
            cache_ttl: Duration::from_secs(300),
            workers: 8,
            queue_capacity: 256,
            push_retry: RetryPolicy::default(),
            health_retry: RetryPolicy::default(),
            log_forwards: crate::logs::forwarder::DISCARD.to_string(),
            log_writer: LogWriterConfig::default(),
            log_buffer: 1024,
            subscriber_buffer: 256,
            collect_metrics: true,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

struct Inner {
    config: ManagerConfig,
    runtime: Arc<GuardedRuntime>,
    store: Arc<CachedStore>,
    broadcaster: Arc<LogBroadcaster>,
    writer: Arc<LogWriter>,
    attacher: Arc<LogAttacher>,
    handlers: EventHandlers,
    collecting: KeyedLock,
    health: HealthRegistry,
    metrics: AgentMetrics,
    logger: StructuredLogger,
    tracker: TaskTracker,
    /// Cancelled when `run` returns; parent of every task the manager spawns
    shutdown: CancellationToken,
}

/// Reconciliation engine; clones share the same state
#[derive(Clone)]
pub struct WorkloadManager {
    inner: Arc<Inner>,
}

impl WorkloadManager {
    /// Build runtime and store from configuration
    pub fn from_config(config: ManagerConfig) -> Result<Self> {
        let runtime = create_runtime(&config.runtime)?;
        let store = create_store(&config.store)?;
        Self::new(config, runtime, store)
    }

    pub fn new(config: ManagerConfig, runtime: Arc<dyn Runtime>, store: Arc<dyn Store>) -> Result<Self> {
        let shutdown = CancellationToken::new();
        let runtime = Arc::new(GuardedRuntime::new(runtime));
        let store = Arc::new(CachedStore::new(store, config.cache_ttl));
        let broadcaster = Arc::new(LogBroadcaster::new(config.log_buffer, config.subscriber_buffer));
        let writer = Arc::new(
            LogWriter::new(&config.log_forwards, config.log_writer, shutdown.child_token())
                .map_err(|e| AgentError::Config(e.to_string()))?,
        );
        let attacher = Arc::new(LogAttacher::new(
            runtime.clone(),
            LogSink {
                broadcaster: broadcaster.inbound(),
                writer: writer.clone(),
            },
            config.runtime_timeout,
        ));
        let logger = StructuredLogger::new(config.nodename.clone());

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let handlers = EventHandlers::new();
            register_lifecycle_handlers(&handlers, weak.clone());
            Inner {
                config,
                runtime,
                store,
                broadcaster,
                writer,
                attacher,
                handlers,
                collecting: KeyedLock::new(),
                health: HealthRegistry::new(),
                metrics: AgentMetrics::new(),
                logger,
                tracker: TaskTracker::new(),
                shutdown,
            }
        });

        Ok(Self { inner })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<CachedStore> {
        &self.inner.store
    }

    pub fn runtime(&self) -> &Arc<GuardedRuntime> {
        &self.inner.runtime
    }

    pub fn broadcaster(&self) -> &Arc<LogBroadcaster> {
        &self.inner.broadcaster
    }

    pub fn handlers(&self) -> &EventHandlers {
        &self.inner.handlers
    }

    pub fn health_registry(&self) -> HealthRegistry {
        self.inner.health.clone()
    }

    /// Run until `token` is cancelled (`Ok`) or the event stream fails (`Err`).
    ///
    /// The event stream is not restarted; a failure is returned to the caller.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        let result = self.run_inner(&token).await;

        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        if tokio::time::timeout(self.inner.config.shutdown_grace, self.inner.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = self.inner.tracker.len(),
                "Tasks still running after shutdown grace period"
            );
        }

        match &result {
            Ok(()) => info!("Workload manager stopped"),
            Err(e) => error!(error = %e, "Workload manager stopped with error"),
        }
        result
    }

    async fn run_inner(&self, token: &CancellationToken) -> Result<()> {
        let shutdown = self.inner.shutdown.clone();

        self.inner.writer.connect();
        {
            let broadcaster = self.inner.broadcaster.clone();
            let token = shutdown.child_token();
            self.inner.tracker.spawn(async move { broadcaster.run(token).await });
        }

        tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            _ = self.initial_load() => {}
        }
        self.inner.health.set_ready(true);

        let EventStream { events, errors } = match with_timeout(
            "events",
            self.inner.config.runtime_timeout,
            self.inner
                .runtime
                .events(&self.inner.config.filter, shutdown.child_token()),
        )
        .await
        {
            Ok(stream) => stream,
            Err(e) => {
                self.inner
                    .health
                    .set_unhealthy(components::EVENT_MONITOR, e.to_string());
                return Err(e);
            }
        };
        self.inner.health.set_healthy(components::EVENT_MONITOR);

        let monitor = EventMonitor::new(
            self.inner.handlers.clone(),
            self.inner.tracker.clone(),
            self.inner.logger.clone(),
        );
        {
            let token = shutdown.child_token();
            self.inner
                .tracker
                .spawn(async move { monitor.watch(events, token).await });
        }
        {
            let manager = self.clone();
            let token = shutdown.child_token();
            self.inner
                .tracker
                .spawn(async move { manager.health_check_loop(token).await });
        }

        tokio::select! {
            biased;
            _ = token.cancelled() => Ok(()),
            terminal = errors => {
                let err = terminal.unwrap_or(AgentError::EventStreamClosed);
                self.inner
                    .health
                    .set_unhealthy(components::EVENT_MONITOR, err.to_string());
                Err(err)
            }
        }
    }

    /// Write one status snapshot to the store.
    ///
    /// The snapshot is normalized first; transient failures are retried.
    pub async fn push_status(&self, status: WorkloadStatus) -> Result<()> {
        let status = status.normalized();
        let ttl = self.inner.config.status_ttl;
        let timeout = self.inner.config.store_timeout;
        let store = &self.inner.store;

        let result = self
            .inner
            .config
            .push_retry
            .retry_if(
                &self.inner.shutdown,
                |_| with_timeout("set_workload_status", timeout, store.set_workload_status(&status, ttl)),
                AgentError::is_retryable,
            )
            .await;

        match result {
            Ok(()) => {
                self.inner.metrics.inc_status_pushes();
                self.inner.health.set_healthy(components::STORE);
                self.inner.logger.log_status_pushed(&status, ttl);
                Ok(())
            }
            Err(e) => {
                self.inner.metrics.inc_status_push_failures();
                self.inner.health.set_degraded(components::STORE, e.to_string());
                warn!(workload_id = %status.id, error = %e, "Failed to push workload status");
                Err(e)
            }
        }
    }

    /// Probe-aware status fetch bounded by the check timeout
    async fn probe_status(&self, id: &str) -> Result<WorkloadStatus> {
        let started = std::time::Instant::now();
        let result = with_timeout(
            "get_status",
            self.inner.config.check_timeout,
            self.inner.runtime.get_status(id, true),
        )
        .await;
        if !matches!(result, Err(AgentError::LockFailed(_))) {
            self.inner
                .metrics
                .observe_health_check_latency(started.elapsed().as_secs_f64());
        }
        result
    }

    /// Start pumping the workload's output. Idempotent per ID
    fn spawn_attach(&self, id: &str) {
        if self.inner.attacher.is_attached(id) {
            return;
        }
        let attacher = self.inner.attacher.clone();
        let token = self.inner.shutdown.child_token();
        let id = id.to_string();
        self.inner
            .tracker
            .spawn(async move { attacher.attach(&id, token).await });
    }

    /// Start resource sampling for a running workload. Idempotent per ID
    fn spawn_metrics(&self, id: &str) {
        if !self.inner.config.collect_metrics {
            return;
        }
        let Some(guard) = self.inner.collecting.try_acquire(id) else {
            return;
        };
        let runtime = self.inner.runtime.clone();
        let token = self.inner.shutdown.child_token();
        self.inner.tracker.spawn(async move {
            let id = guard.key().to_string();
            runtime.collect_workload_metrics(token, &id).await;
            drop(guard);
        });
    }

    async fn handle_start(&self, event: WorkloadEventMessage) {
        let id = event.id;
        let status = match self.probe_status(&id).await {
            Ok(status) => status,
            Err(AgentError::LockFailed(_)) => {
                // A sweep probe is in flight; retry until it is done.
                self.spawn_check_until_healthy(&id);
                return;
            }
            Err(e) => {
                warn!(workload_id = %id, error = %e, "Failed to get status of started workload");
                return;
            }
        };

        if status.running {
            self.spawn_attach(&id);
            self.spawn_metrics(&id);
        }

        if status.healthy {
            let _ = self.push_status(status).await;
        } else {
            self.spawn_check_until_healthy(&id);
        }
    }

    async fn handle_die(&self, event: WorkloadEventMessage) {
        let id = event.id;
        let status = match self.probe_status(&id).await {
            Ok(status) => status,
            Err(AgentError::LockFailed(_)) => {
                match with_timeout(
                    "get_status",
                    self.inner.config.runtime_timeout,
                    self.inner.runtime.get_status(&id, false),
                )
                .await
                {
                    Ok(status) => status,
                    Err(e) => {
                        warn!(workload_id = %id, error = %e, "Failed to get status of stopped workload");
                        return;
                    }
                }
            }
            Err(e) => {
                warn!(workload_id = %id, error = %e, "Failed to get status of stopped workload");
                return;
            }
        };
        let _ = self.push_status(status).await;
    }
}

fn register_lifecycle_handlers(handlers: &EventHandlers, weak: Weak<Inner>) {
    let start = weak.clone();
    handlers.register_fn(actions::START, move |event| {
        let start = start.clone();
        async move {
            if let Some(inner) = start.upgrade() {
                WorkloadManager { inner }.handle_start(event).await;
            }
        }
    });

    handlers.register_fn(actions::DIE, move |event| {
        let die = weak.clone();
        async move {
            if let Some(inner) = die.upgrade() {
                WorkloadManager { inner }.handle_die(event).await;
            } else {
                debug!("Manager gone, dropping die event");
            }
        }
    });
}
