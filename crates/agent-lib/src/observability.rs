//! Observability infrastructure for the workload agent
//!
//! Provides:
//! - Prometheus metrics (status pushes, events, health-check latency, log pipeline,
//!   per-workload gauges fed by runtime metric collection)
//! - Structured event logging with tracing

use crate::models::{WorkloadEventMessage, WorkloadStatus};
use prometheus::{
    register_gauge_vec, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge, GaugeVec, Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for health-check latency (in seconds)
const PROBE_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();

struct AgentMetricsInner {
    status_pushes: IntCounter,
    status_pushes_suppressed: IntCounter,
    status_push_failures: IntCounter,
    events_received: IntCounterVec,
    health_check_latency_seconds: Histogram,
    log_lines_forwarded: IntCounter,
    log_lines_dropped: IntCounter,
    log_subscribers: IntGauge,
    workloads_monitored: IntGauge,
    node_heartbeats: IntCounter,
    workload_metric: GaugeVec,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            status_pushes: register_int_counter!(
                "eru_agent_status_pushes_total",
                "Workload status snapshots written to the store"
            )
            .expect("Failed to register status_pushes_total"),

            status_pushes_suppressed: register_int_counter!(
                "eru_agent_status_pushes_suppressed_total",
                "Status pushes skipped because the snapshot was unchanged"
            )
            .expect("Failed to register status_pushes_suppressed_total"),

            status_push_failures: register_int_counter!(
                "eru_agent_status_push_failures_total",
                "Status pushes that failed after retries"
            )
            .expect("Failed to register status_push_failures_total"),

            events_received: register_int_counter_vec!(
                "eru_agent_events_received_total",
                "Runtime events received by the monitor",
                &["action"]
            )
            .expect("Failed to register events_received_total"),

            health_check_latency_seconds: register_histogram!(
                "eru_agent_health_check_latency_seconds",
                "Time spent fetching a workload status with a health probe",
                PROBE_BUCKETS.to_vec()
            )
            .expect("Failed to register health_check_latency_seconds"),

            log_lines_forwarded: register_int_counter!(
                "eru_agent_log_lines_forwarded_total",
                "Log lines written to the forwarder"
            )
            .expect("Failed to register log_lines_forwarded_total"),

            log_lines_dropped: register_int_counter!(
                "eru_agent_log_lines_dropped_total",
                "Log lines dropped because the forwarder was unavailable"
            )
            .expect("Failed to register log_lines_dropped_total"),

            log_subscribers: register_int_gauge!(
                "eru_agent_log_subscribers",
                "Live log subscribers"
            )
            .expect("Failed to register log_subscribers"),

            workloads_monitored: register_int_gauge!(
                "eru_agent_workloads_monitored",
                "Workloads seen by the last listing"
            )
            .expect("Failed to register workloads_monitored"),

            node_heartbeats: register_int_counter!(
                "eru_agent_node_heartbeats_total",
                "Successful node heartbeats"
            )
            .expect("Failed to register node_heartbeats_total"),

            workload_metric: register_gauge_vec!(
                "eru_agent_workload_metric",
                "Resource usage sampled from workloads",
                &["metric", "id", "app", "node"]
            )
            .expect("Failed to register workload_metric"),
        }
    }
}

/// Agent metrics for Prometheus exposition
///
/// A lightweight handle to the global metrics instance; clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct AgentMetrics {
    inner: &'static AgentMetricsInner,
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    pub fn new() -> Self {
        Self {
            inner: GLOBAL_METRICS.get_or_init(AgentMetricsInner::new),
        }
    }

    pub fn inc_status_pushes(&self) {
        self.inner.status_pushes.inc();
    }

    pub fn inc_status_pushes_suppressed(&self) {
        self.inner.status_pushes_suppressed.inc();
    }

    pub fn inc_status_push_failures(&self) {
        self.inner.status_push_failures.inc();
    }

    pub fn inc_events_received(&self, action: &str) {
        self.inner.events_received.with_label_values(&[action]).inc();
    }

    pub fn observe_health_check_latency(&self, duration_secs: f64) {
        self.inner.health_check_latency_seconds.observe(duration_secs);
    }

    pub fn inc_log_lines_forwarded(&self) {
        self.inner.log_lines_forwarded.inc();
    }

    pub fn inc_log_lines_dropped(&self) {
        self.inner.log_lines_dropped.inc();
    }

    pub fn set_log_subscribers(&self, count: i64) {
        self.inner.log_subscribers.set(count);
    }

    pub fn set_workloads_monitored(&self, count: i64) {
        self.inner.workloads_monitored.set(count);
    }

    pub fn inc_node_heartbeats(&self) {
        self.inner.node_heartbeats.inc();
    }

    /// Record one resource-usage sample tagged by workload identity
    pub fn set_workload_gauge(&self, metric: &str, id: &str, app: &str, node: &str, value: f64) {
        self.inner
            .workload_metric
            .with_label_values(&[metric, id, app, node])
            .set(value);
    }

    /// Drop every gauge series of a workload that went away
    pub fn remove_workload_gauge(&self, metric: &str, id: &str, app: &str, node: &str) {
        let _ = self
            .inner
            .workload_metric
            .remove_label_values(&[metric, id, app, node]);
    }
}

/// Structured logger for agent events
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn log_startup(&self, version: &str, runtime: &str, store: &str) {
        info!(
            event = "agent_started",
            node = %self.node_name,
            agent_version = %version,
            runtime = %runtime,
            store = %store,
            "Workload agent started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Workload agent shutting down"
        );
    }

    pub fn log_workload_event(&self, event: &WorkloadEventMessage) {
        info!(
            event = "workload_event",
            node = %self.node_name,
            workload_id = %event.id,
            action = %event.action,
            time_nano = event.time_nano,
            "Workload event received"
        );
    }

    pub fn log_status_pushed(&self, status: &WorkloadStatus, ttl: i64) {
        info!(
            event = "status_pushed",
            node = %self.node_name,
            workload_id = %status.id,
            appname = %status.appname,
            running = status.running,
            healthy = status.healthy,
            ttl = ttl,
            "Workload status reported"
        );
    }

    pub fn log_heartbeat(&self, ttl: i64, success: bool) {
        if success {
            info!(
                event = "node_heartbeat",
                node = %self.node_name,
                ttl = ttl,
                "Node status reported"
            );
        } else {
            warn!(
                event = "node_heartbeat_failed",
                node = %self.node_name,
                ttl = ttl,
                "Failed to report node status"
            );
        }
    }
}
