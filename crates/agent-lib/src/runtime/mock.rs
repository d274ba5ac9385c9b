//! In-memory runtime backed by fixtures
//!
//! Used by the test suite and selectable as runtime type `mock` for dry runs.
//! Workloads, events and failures are all injected by the caller.

use super::probe::{self, HealthCheck};
use super::{parse_workload_name, AttachedStreams, EventStream, Runtime};
use crate::error::{AgentError, Result};
use crate::models::{actions, WorkloadEventMessage, WorkloadFilter, WorkloadStatus};
use crate::observability::AgentMetrics;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use crate::models::OWNER_LABEL;

const EVENT_BUFFER: usize = 256;
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// One fixture workload
#[derive(Debug, Clone)]
pub struct MockWorkload {
    pub id: String,
    /// `app_entrypoint_ident`
    pub name: String,
    pub running: bool,
    /// Reported health when no check is configured
    pub healthy: bool,
    pub health_check: Option<HealthCheck>,
    pub networks: BTreeMap<String, String>,
    pub labels: HashMap<String, String>,
    /// Scripted stdout/stderr; `None` means attach is unsupported
    pub output: Option<(Vec<u8>, Vec<u8>)>,
}

impl MockWorkload {
    pub fn new(id: &str, name: &str, running: bool, healthy: bool) -> Self {
        let mut labels = HashMap::new();
        labels.insert(OWNER_LABEL.to_string(), "1".to_string());
        Self {
            id: id.to_string(),
            name: name.to_string(),
            running,
            healthy,
            health_check: None,
            networks: BTreeMap::new(),
            labels,
            output: None,
        }
    }

    pub fn with_output(mut self, stdout: &[u8], stderr: &[u8]) -> Self {
        self.output = Some((stdout.to_vec(), stderr.to_vec()));
        self
    }

    pub fn with_health_check(mut self, check: HealthCheck) -> Self {
        self.health_check = Some(check);
        self
    }

    pub fn with_network(mut self, name: &str, address: &str) -> Self {
        self.networks.insert(name.to_string(), address.to_string());
        self
    }
}

struct Subscription {
    token: CancellationToken,
    events: mpsc::Sender<WorkloadEventMessage>,
    errors: Option<oneshot::Sender<AgentError>>,
}

/// Fixture-driven runtime
pub struct MockRuntime {
    nodename: String,
    workloads: DashMap<String, MockWorkload>,
    failing: DashSet<String>,
    subscriptions: Mutex<Vec<Subscription>>,
    daemon_running: AtomicBool,
    probe_delay_ms: AtomicU64,
    daemon_delay_ms: AtomicU64,
    probes: AtomicUsize,
    metric_samples: AtomicUsize,
    metrics_interval: Duration,
}

impl MockRuntime {
    pub fn new(nodename: &str) -> Self {
        Self {
            nodename: nodename.to_string(),
            workloads: DashMap::new(),
            failing: DashSet::new(),
            subscriptions: Mutex::new(Vec::new()),
            daemon_running: AtomicBool::new(true),
            probe_delay_ms: AtomicU64::new(0),
            daemon_delay_ms: AtomicU64::new(0),
            probes: AtomicUsize::new(0),
            metric_samples: AtomicUsize::new(0),
            metrics_interval: Duration::from_secs(10),
        }
    }

    /// Rei (running, unhealthy, no check), Shinji (running, healthy), Asuka (stopped)
    pub fn with_fixtures(nodename: &str) -> Self {
        let runtime = Self::new(nodename);
        runtime.insert(
            MockWorkload::new("Rei", "nerv_rei_0000", true, false)
                .with_network("host", "10.0.0.1")
                .with_output(b"rei online\n", b""),
        );
        runtime.insert(
            MockWorkload::new("Shinji", "nerv_shinji_0001", true, true)
                .with_network("host", "10.0.0.2")
                .with_output(b"shinji online\r\n", b"get in the robot\n"),
        );
        runtime.insert(MockWorkload::new("Asuka", "nerv_asuka_0002", false, false));
        runtime
    }

    pub fn insert(&self, workload: MockWorkload) {
        self.workloads.insert(workload.id.clone(), workload);
    }

    /// Make `get_status` fail for `id`
    pub fn fail_status(&self, id: &str) {
        self.failing.insert(id.to_string());
    }

    pub fn set_daemon_running(&self, running: bool) {
        self.daemon_running.store(running, Ordering::SeqCst);
    }

    /// Delay every health probe, to widen race windows in tests
    pub fn set_probe_delay(&self, delay: Duration) {
        self.probe_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_metrics_interval(&mut self, interval: Duration) {
        self.metrics_interval = interval;
    }

    /// Delay every daemon liveness check
    pub fn set_daemon_delay(&self, delay: Duration) {
        self.daemon_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of health probes actually performed
    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn metric_samples(&self) -> usize {
        self.metric_samples.load(Ordering::SeqCst)
    }

    /// Mark the workload running and emit a `start` event
    pub fn start(&self, id: &str) {
        if let Some(mut workload) = self.workloads.get_mut(id) {
            workload.running = true;
        }
        self.emit(id, actions::START);
    }

    /// Mark the workload stopped and emit a `die` event
    pub fn die(&self, id: &str) {
        if let Some(mut workload) = self.workloads.get_mut(id) {
            workload.running = false;
        }
        self.emit(id, actions::DIE);
    }

    /// Send an event with an arbitrary action to every live subscriber
    pub fn emit(&self, id: &str, action: &str) {
        let event = WorkloadEventMessage {
            id: id.to_string(),
            r#type: "container".to_string(),
            action: action.to_string(),
            time_nano: chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default(),
        };
        let mut subs = lock(&self.subscriptions);
        subs.retain(|s| !s.token.is_cancelled() && !s.events.is_closed());
        for sub in subs.iter() {
            if let Err(e) = sub.events.try_send(event.clone()) {
                debug!(error = %e, "Dropping mock event");
            }
        }
    }

    /// End every subscription without an error
    pub fn close_events(&self) {
        lock(&self.subscriptions).clear();
    }

    /// Terminate every subscription with `error`
    pub fn fail_events(&self, error: impl Fn() -> AgentError) {
        let mut subs = lock(&self.subscriptions);
        for mut sub in subs.drain(..) {
            if let Some(tx) = sub.errors.take() {
                let _ = tx.send(error());
            }
        }
    }

    fn workload(&self, id: &str) -> Result<MockWorkload> {
        self.workloads
            .get(id)
            .map(|w| w.clone())
            .ok_or_else(|| AgentError::NotFound(id.to_string()))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[async_trait]
impl Runtime for MockRuntime {
    async fn list_workload_ids(&self, filter: &WorkloadFilter) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .workloads
            .iter()
            .filter(|w| filter.matches(&w.labels))
            .map(|w| w.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn get_status(&self, id: &str, check_health: bool) -> Result<WorkloadStatus> {
        if self.failing.contains(id) {
            return Err(AgentError::Runtime(format!("injected status failure for {}", id)));
        }
        let workload = self.workload(id)?;
        if !workload.labels.contains_key(OWNER_LABEL) {
            return Err(AgentError::Invalid(id.to_string()));
        }
        let (appname, entrypoint, _) = parse_workload_name(&workload.name)?;

        let healthy = if !workload.running {
            false
        } else if check_health {
            self.probes.fetch_add(1, Ordering::SeqCst);
            let delay = self.probe_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            match &workload.health_check {
                Some(check) => check.probe(PROBE_TIMEOUT).await,
                None => workload.healthy,
            }
        } else if workload.health_check.is_some() {
            probe::default_health(workload.running, workload.health_check.as_ref())
        } else {
            workload.healthy
        };

        let labels: BTreeMap<&String, &String> = workload.labels.iter().collect();
        Ok(WorkloadStatus {
            id: workload.id.clone(),
            running: workload.running,
            healthy,
            networks: workload.networks.clone(),
            extension: serde_json::to_vec(&labels).map_err(anyhow::Error::from)?,
            appname,
            entrypoint,
            nodename: self.nodename.clone(),
        })
    }

    async fn attach_workload(&self, id: &str) -> Result<AttachedStreams> {
        let workload = self.workload(id)?;
        let (stdout, stderr) = workload
            .output
            .ok_or(AgentError::NotImplemented("attach"))?;
        Ok(AttachedStreams {
            stdout: Box::new(std::io::Cursor::new(stdout)),
            stderr: Box::new(std::io::Cursor::new(stderr)),
        })
    }

    async fn events(
        &self,
        _filter: &WorkloadFilter,
        token: CancellationToken,
    ) -> Result<EventStream> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (errors_tx, errors_rx) = oneshot::channel();
        let mut subs = lock(&self.subscriptions);
        subs.push(Subscription {
            token,
            events: events_tx,
            errors: Some(errors_tx),
        });
        Ok(EventStream {
            events: events_rx,
            errors: errors_rx,
        })
    }

    async fn collect_workload_metrics(&self, token: CancellationToken, id: &str) {
        let metrics = AgentMetrics::new();
        loop {
            let Ok(workload) = self.workload(id) else { return };
            if !workload.running {
                return;
            }
            let app = parse_workload_name(&workload.name)
                .map(|(app, _, _)| app)
                .unwrap_or_default();
            metrics.set_workload_gauge("running", id, &app, &self.nodename, 1.0);
            self.metric_samples.fetch_add(1, Ordering::SeqCst);

            tokio::select! {
                _ = tokio::time::sleep(self.metrics_interval) => {}
                _ = token.cancelled() => return,
            }
        }
    }

    async fn get_workload_name(&self, id: &str) -> Result<String> {
        Ok(self.workload(id)?.name)
    }

    async fn log_fields_extra(&self, id: &str) -> Result<HashMap<String, String>> {
        let workload = self.workload(id)?;
        let mut extra = HashMap::new();
        extra.insert("nodename".to_string(), self.nodename.clone());
        if let Some(addr) = workload.networks.values().next() {
            extra.insert("address".to_string(), addr.clone());
        }
        Ok(extra)
    }

    async fn is_daemon_running(&self) -> bool {
        let delay = self.daemon_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.daemon_running.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        "mock"
    }
}
