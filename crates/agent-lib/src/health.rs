//! Self-health of the agent process
//!
//! Tracks the state of the agent's own components (runtime connection, store,
//! event monitor, ...) for the liveness and readiness endpoints. This is not
//! the workload health check; see [`crate::manager`] for that.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Health status of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Operational with reduced freshness (e.g. store unreachable)
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    fn with(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names for health tracking
pub mod components {
    pub const RUNTIME: &str = "runtime";
    pub const STORE: &str = "store";
    pub const EVENT_MONITOR: &str = "event_monitor";
    pub const HEALTH_CHECKER: &str = "health_checker";
    pub const LOG_FORWARDER: &str = "log_forwarder";
}

/// Shared registry of component health; clones share state
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    components: Arc<DashMap<String, ComponentHealth>>,
    ready: Arc<AtomicBool>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_healthy(&self, name: &str) {
        self.components.insert(
            name.to_string(),
            ComponentHealth::with(ComponentStatus::Healthy, None),
        );
    }

    pub fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.components.insert(
            name.to_string(),
            ComponentHealth::with(ComponentStatus::Degraded, Some(message.into())),
        );
    }

    pub fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.components.insert(
            name.to_string(),
            ComponentHealth::with(ComponentStatus::Unhealthy, Some(message.into())),
        );
    }

    /// Set once bootstrap has completed
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Worst component status wins
    pub fn health(&self) -> HealthResponse {
        let components: HashMap<String, ComponentHealth> = self
            .components
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let status = if components
            .values()
            .any(|c| c.status == ComponentStatus::Unhealthy)
        {
            ComponentStatus::Unhealthy
        } else if components
            .values()
            .any(|c| c.status == ComponentStatus::Degraded)
        {
            ComponentStatus::Degraded
        } else {
            ComponentStatus::Healthy
        };

        HealthResponse { status, components }
    }

    pub fn readiness(&self) -> ReadinessResponse {
        if !self.ready.load(Ordering::SeqCst) {
            return ReadinessResponse {
                ready: false,
                reason: Some("Initial workload load not finished".to_string()),
            };
        }
        if self.health().status == ComponentStatus::Unhealthy {
            return ReadinessResponse {
                ready: false,
                reason: Some("Critical component unhealthy".to_string()),
            };
        }
        ReadinessResponse {
            ready: true,
            reason: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let registry = HealthRegistry::new();
        let health = registry.health();
        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components.is_empty());
        assert!(!registry.readiness().ready);
    }

    #[test]
    fn test_degraded_store_keeps_agent_ready() {
        let registry = HealthRegistry::new();
        registry.set_healthy(components::RUNTIME);
        registry.set_degraded(components::STORE, "connection refused");
        registry.set_ready(true);

        assert_eq!(registry.health().status, ComponentStatus::Degraded);
        assert!(registry.readiness().ready);
    }

    #[test]
    fn test_unhealthy_component_fails_readiness() {
        let registry = HealthRegistry::new();
        registry.set_ready(true);
        registry.set_unhealthy(components::EVENT_MONITOR, "event stream closed");

        assert_eq!(registry.health().status, ComponentStatus::Unhealthy);
        let readiness = registry.readiness();
        assert!(!readiness.ready);
        assert!(readiness.reason.is_some());
    }

    #[test]
    fn test_recovery_overwrites_previous_state() {
        let registry = HealthRegistry::new();
        registry.set_unhealthy(components::STORE, "down");
        registry.set_healthy(components::STORE);
        assert_eq!(registry.health().status, ComponentStatus::Healthy);
    }
}
