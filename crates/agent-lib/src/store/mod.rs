//! Remote-store capability contract
//!
//! The control plane receives workload and node status through [`Store`].
//! The agent talks to it via [`CachedStore`], which suppresses repeated
//! zero-TTL pushes of an unchanged snapshot.

mod cache;
pub mod grpc;
pub mod mock;

#[cfg(test)]
mod tests;

pub use cache::CachedStore;
pub use grpc::{CoreStore, CoreStoreBuilder};
pub use mock::MockStore;

use crate::error::{AgentError, Result};
use crate::models::{Node, NodeStatus, WorkloadStatus};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Subscription to node liveness changes.
///
/// `errors` yields at most one terminal error; afterwards both channels close.
pub struct NodeStatusStream {
    pub statuses: mpsc::Receiver<NodeStatus>,
    pub errors: oneshot::Receiver<AgentError>,
}

/// Operations the agent needs from the control plane
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_node(&self, nodename: &str) -> Result<Node>;

    /// Write one workload snapshot; `ttl` of 0 means no expiry
    async fn set_workload_status(&self, status: &WorkloadStatus, ttl: i64) -> Result<()>;

    /// Mark this node alive for `ttl` seconds; a negative `ttl` removes the mark
    async fn set_node_status(&self, ttl: i64) -> Result<()>;

    async fn list_pod_nodes(&self, podname: &str, all: bool) -> Result<Vec<Node>>;

    /// Watch liveness changes of every node until `token` is cancelled
    async fn node_status_stream(&self, token: CancellationToken) -> Result<NodeStatusStream>;

    /// Stable identity of the remote endpoint, for logs
    fn identifier(&self) -> String;
}

/// Supported store backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Grpc,
    Mock,
}

/// Store selection and connection settings
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub kind: StoreKind,
    /// Core endpoints; the first one is used
    pub endpoints: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Name this agent reports node status under
    pub nodename: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Grpc,
            endpoints: vec!["http://127.0.0.1:5001".to_string()],
            username: None,
            password: None,
            nodename: "localhost".to_string(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Build the configured store. Selected once at startup
pub fn create_store(config: &StoreConfig) -> Result<Arc<dyn Store>> {
    match config.kind {
        StoreKind::Mock => {
            tracing::info!("Using in-memory mock store");
            Ok(Arc::new(MockStore::new(&config.nodename)))
        }
        StoreKind::Grpc => {
            let endpoint = config
                .endpoints
                .first()
                .ok_or_else(|| AgentError::Config("store endpoints are empty".to_string()))?;

            let mut builder = CoreStoreBuilder::new()
                .endpoint(endpoint.clone())
                .nodename(config.nodename.clone())
                .connect_timeout(config.connect_timeout)
                .request_timeout(config.request_timeout);
            if let (Some(user), Some(pass)) = (&config.username, &config.password) {
                builder = builder.credentials(user.clone(), pass.clone());
            }
            Ok(Arc::new(builder.build()?))
        }
    }
}
