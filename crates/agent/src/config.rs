//! Agent configuration
//!
//! Loaded from an optional file named by `AGENT_CONFIG_FILE` and overridden by
//! `AGENT__<SECTION>__<KEY>` environment variables, e.g.
//! `AGENT__HEALTH_CHECK__INTERVAL_SECS=30`.

use agent_lib::logs::LogTarget;
use agent_lib::runtime::{RuntimeConfig, RuntimeKind};
use agent_lib::store::{StoreConfig, StoreKind};
use agent_lib::util::RetryPolicy;
use agent_lib::{ManagerConfig, NodeConfig, WorkloadFilter, OWNER_LABEL};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const CONFIG_FILE_ENV: &str = "AGENT_CONFIG_FILE";

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Name of this host in the store
    #[serde(default = "default_nodename")]
    pub nodename: String,

    /// Port of the health/metrics API
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Port of the raw log subscription server
    #[serde(default = "default_log_port")]
    pub log_port: u16,

    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    #[serde(default)]
    pub runtime: RuntimeSection,

    #[serde(default)]
    pub store: StoreSection,

    #[serde(default)]
    pub health_check: HealthCheckSection,

    #[serde(default)]
    pub log: LogSection,

    #[serde(default)]
    pub heartbeat: HeartbeatSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeSection {
    pub kind: RuntimeKind,
    pub endpoint: String,
    pub timeout_secs: u64,
    /// Sample per-workload resource usage
    pub collect_metrics: bool,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            kind: RuntimeKind::Docker,
            endpoint: "unix:///var/run/docker.sock".to_string(),
            timeout_secs: 10,
            collect_metrics: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub kind: StoreKind,
    pub endpoints: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// Attempts per status push
    pub retry_attempts: u32,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            kind: StoreKind::Grpc,
            endpoints: vec!["http://127.0.0.1:5001".to_string()],
            username: None,
            password: None,
            connect_timeout_secs: 5,
            request_timeout_secs: 10,
            retry_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthCheckSection {
    pub interval_secs: u64,
    pub timeout_secs: u64,
    /// TTL of pushed statuses; 0 means no expiry
    pub status_ttl: i64,
    /// Suppression window for unchanged statuses; 0 disables
    pub cache_ttl_secs: u64,
    pub workers: usize,
    pub queue_capacity: usize,
    /// Re-checks of a started workload before giving up
    pub retry_attempts: u32,
}

impl Default for HealthCheckSection {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            timeout_secs: 10,
            status_ttl: 0,
            cache_ttl_secs: 300,
            workers: 8,
            queue_capacity: 256,
            retry_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// `udp://host:port`, `tcp://host:port`, `journal://[socket]` or `__discard__`
    pub forwards: String,
    pub buffer: usize,
    pub subscriber_buffer: usize,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            forwards: agent_lib::logs::forwarder::DISCARD.to_string(),
            buffer: 1024,
            subscriber_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeartbeatSection {
    pub interval_secs: u64,
    pub ttl: i64,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            ttl: 180,
        }
    }
}

fn default_nodename() -> String {
    std::env::var("NODE_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

fn default_api_port() -> u16 {
    12345
}

fn default_log_port() -> u16 {
    12346
}

fn default_shutdown_grace() -> u64 {
    5
}

impl AgentConfig {
    /// Load from `AGENT_CONFIG_FILE` (if set) and the environment
    pub fn load() -> Result<Self> {
        let file = std::env::var(CONFIG_FILE_ENV).ok();
        Self::load_from(file.as_deref().map(Path::new))
    }

    pub fn load_from(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path));
        }
        let config: AgentConfig = builder
            .add_source(
                config::Environment::with_prefix("AGENT")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("store.endpoints")
                    .try_parsing(true),
            )
            .build()
            .context("failed to read configuration")?
            .try_deserialize()
            .context("invalid configuration")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.nodename.is_empty() {
            bail!("nodename must not be empty");
        }
        if self.health_check.interval_secs == 0 {
            bail!("health_check.interval_secs must be positive");
        }
        if self.health_check.timeout_secs == 0 || self.runtime.timeout_secs == 0 {
            bail!("timeouts must be positive");
        }
        if self.heartbeat.interval_secs == 0 {
            bail!("heartbeat.interval_secs must be positive");
        }
        if self.heartbeat.ttl <= 0 {
            bail!("heartbeat.ttl must be positive");
        }
        if self.health_check.workers == 0 {
            bail!("health_check.workers must be positive");
        }
        if self.store.kind == StoreKind::Grpc && self.store.endpoints.is_empty() {
            bail!("store.endpoints must not be empty");
        }
        LogTarget::parse(&self.log.forwards)
            .with_context(|| format!("invalid log.forwards {:?}", self.log.forwards))?;
        Ok(())
    }

    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            kind: self.runtime.kind,
            endpoint: self.runtime.endpoint.clone(),
            nodename: self.nodename.clone(),
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            kind: self.store.kind,
            endpoints: self.store.endpoints.clone(),
            username: self.store.username.clone(),
            password: self.store.password.clone(),
            nodename: self.nodename.clone(),
            connect_timeout: Duration::from_secs(self.store.connect_timeout_secs),
            request_timeout: Duration::from_secs(self.store.request_timeout_secs),
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        let store_timeout = Duration::from_secs(self.store.request_timeout_secs);
        ManagerConfig {
            nodename: self.nodename.clone(),
            runtime: self.runtime_config(),
            store: self.store_config(),
            filter: WorkloadFilter::new().label(OWNER_LABEL, "1"),
            check_interval: Duration::from_secs(self.health_check.interval_secs),
            check_timeout: Duration::from_secs(self.health_check.timeout_secs),
            runtime_timeout: Duration::from_secs(self.runtime.timeout_secs),
            store_timeout,
            status_ttl: self.health_check.status_ttl,
            cache_ttl: Duration::from_secs(self.health_check.cache_ttl_secs),
            workers: self.health_check.workers,
            queue_capacity: self.health_check.queue_capacity,
            push_retry: RetryPolicy {
                max_attempts: self.store.retry_attempts,
                ..RetryPolicy::default()
            },
            health_retry: RetryPolicy {
                max_attempts: self.health_check.retry_attempts,
                ..RetryPolicy::default()
            },
            log_forwards: self.log.forwards.clone(),
            log_buffer: self.log.buffer,
            subscriber_buffer: self.log.subscriber_buffer,
            collect_metrics: self.runtime.collect_metrics,
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            ..ManagerConfig::default()
        }
    }

    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            nodename: self.nodename.clone(),
            heartbeat_interval: Duration::from_secs(self.heartbeat.interval_secs),
            node_ttl: self.heartbeat.ttl,
            store_timeout: Duration::from_secs(self.store.request_timeout_secs),
            runtime_timeout: Duration::from_secs(self.runtime.timeout_secs),
            retry: RetryPolicy {
                max_attempts: self.store.retry_attempts,
                ..RetryPolicy::default()
            },
            ..NodeConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_from_file() {
        let file = write_config(
            r#"
            nodename = "node-7"
            api_port = 9000

            [runtime]
            kind = "mock"

            [store]
            kind = "grpc"
            endpoints = ["core-1:5001", "core-2:5001"]
            username = "eru"
            password = "secret"

            [health_check]
            interval_secs = 30
            status_ttl = 60

            [log]
            forwards = "udp://127.0.0.1:5140"
            "#,
        );

        let config = AgentConfig::load_from(Some(file.path())).unwrap();
        assert_eq!(config.nodename, "node-7");
        assert_eq!(config.api_port, 9000);
        assert_eq!(config.log_port, 12346);
        assert_eq!(config.runtime.kind, RuntimeKind::Mock);
        assert_eq!(config.store.endpoints.len(), 2);

        let manager = config.manager_config();
        assert_eq!(manager.check_interval, Duration::from_secs(30));
        assert_eq!(manager.check_timeout, Duration::from_secs(10));
        assert_eq!(manager.status_ttl, 60);
        assert_eq!(manager.log_forwards, "udp://127.0.0.1:5140");
        assert_eq!(manager.store.username.as_deref(), Some("eru"));
        assert_eq!(manager.runtime.nodename, "node-7");

        let node = config.node_config();
        assert_eq!(node.node_ttl, 180);
        assert_eq!(node.nodename, "node-7");
    }

    #[test]
    fn test_rejects_zero_interval() {
        let file = write_config(
            r#"
            nodename = "node-7"
            [health_check]
            interval_secs = 0
            "#,
        );
        assert!(AgentConfig::load_from(Some(file.path())).is_err());
    }

    #[test]
    fn test_rejects_bad_forward_address() {
        let file = write_config(
            r#"
            nodename = "node-7"
            [log]
            forwards = "carrier-pigeon://coop"
            "#,
        );
        let err = AgentConfig::load_from(Some(file.path())).unwrap_err();
        assert!(format!("{:#}", err).contains("log.forwards"));
    }

    #[test]
    fn test_defaults_are_valid() {
        let file = write_config("nodename = \"node-7\"\n");
        let config = AgentConfig::load_from(Some(file.path())).unwrap();
        assert_eq!(config.health_check.interval_secs, 15);
        assert_eq!(config.log.forwards, "__discard__");
        assert_eq!(config.store.kind, StoreKind::Grpc);
    }
}
