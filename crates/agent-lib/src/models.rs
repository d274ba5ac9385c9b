//! Core data models for the workload agent

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Canonical status snapshot pushed to the remote store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadStatus {
    pub id: String,
    pub running: bool,
    pub healthy: bool,
    pub networks: BTreeMap<String, String>,
    /// Opaque serialized labels
    pub extension: Vec<u8>,
    pub appname: String,
    pub entrypoint: String,
    pub nodename: String,
}

impl WorkloadStatus {
    /// Enforce that a non-running workload is never reported healthy
    pub fn normalized(mut self) -> Self {
        if !self.running {
            self.healthy = false;
        }
        self
    }
}

/// Change event emitted by a runtime's event feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadEventMessage {
    pub id: String,
    pub r#type: String,
    pub action: String,
    pub time_nano: i64,
}

/// Label marking workloads owned by this agent
pub const OWNER_LABEL: &str = "ERU";

/// Actions the monitor reacts to
pub mod actions {
    pub const START: &str = "start";
    pub const DIE: &str = "die";
}

/// Label filter used when listing workloads or subscribing to events
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkloadFilter {
    pub labels: BTreeMap<String, String>,
}

impl WorkloadFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// True when every filter label is present with the same value
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        self.labels
            .iter()
            .all(|(k, v)| labels.get(k).map(|l| l == v).unwrap_or(false))
    }
}

/// Which output stream a log line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStreamType {
    Stdout,
    Stderr,
}

impl LogStreamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStreamType::Stdout => "stdout",
            LogStreamType::Stderr => "stderr",
        }
    }
}

/// One captured line of workload output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: String,
    /// Application name, also the subscription key
    pub name: String,
    pub r#type: LogStreamType,
    pub entrypoint: String,
    pub ident: String,
    pub data: String,
    pub datetime: String,
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

/// Datetime format of log records
pub const LOG_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Node registered in the control plane
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub endpoint: String,
    pub podname: String,
    pub available: bool,
    pub labels: HashMap<String, String>,
}

/// Node liveness notification from the store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub nodename: String,
    pub podname: String,
    pub alive: bool,
    pub error: Option<String>,
}
