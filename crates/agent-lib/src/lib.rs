//! Per-host workload lifecycle agent
//!
//! This crate provides the core functionality for:
//! - Reporting workload status from a container or VM runtime to the store
//! - Health probing of running workloads
//! - Capturing workload output and streaming it to forwarders and subscribers
//! - Node liveness heartbeats
//! - Health checks and observability of the agent itself

pub mod error;
pub mod health;
pub mod logs;
pub mod manager;
pub mod models;
pub mod node;
pub mod observability;
pub mod proto;
pub mod runtime;
pub mod store;
pub mod util;

pub use error::{AgentError, Result};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use manager::{ManagerConfig, WorkloadManager};
pub use models::*;
pub use node::{NodeConfig, NodeManager};
pub use observability::{AgentMetrics, StructuredLogger};
