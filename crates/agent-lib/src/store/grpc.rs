//! gRPC client for the core control-plane service
//!
//! This module provides the production [`Store`] that:
//! - Connects lazily and reuses one HTTP/2 channel
//! - Attaches optional username/password metadata to every call
//! - Tracks connection state with exponential backoff between reconnects

use super::{NodeStatusStream, Store};
use crate::error::{AgentError, Result};
use crate::models::{Node, NodeStatus, WorkloadStatus};
use crate::proto::{
    CoreRpcClient, Empty, GetNodeOptions, ListNodesOptions, SetNodeStatusOptions,
    SetWorkloadsStatusOptions,
};
use anyhow::Context;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::Channel;
use tracing::{debug, info, warn};

const NODE_STATUS_BUFFER: usize = 64;

/// Configuration for the core client
#[derive(Debug, Clone)]
pub struct CoreStoreConfig {
    /// Core endpoint (e.g., "http://core:5001"); a bare `host:port` gets `http://`
    pub endpoint: String,
    /// Node this agent reports status for
    pub nodename: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub keepalive_interval: Duration,
    /// Initial backoff for reconnection
    pub initial_backoff: Duration,
    /// Maximum backoff for reconnection
    pub max_backoff: Duration,
}

impl Default for CoreStoreConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:5001".to_string(),
            nodename: String::new(),
            username: None,
            password: None,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(30),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Connection state for tracking reconnection attempts
#[derive(Debug, Clone)]
struct ConnectionState {
    connected: bool,
    last_error: Option<String>,
    reconnect_attempts: u32,
    current_backoff: Duration,
    next_attempt_at: Option<Instant>,
}

impl ConnectionState {
    fn new(initial_backoff: Duration) -> Self {
        Self {
            connected: false,
            last_error: None,
            reconnect_attempts: 0,
            current_backoff: initial_backoff,
            next_attempt_at: None,
        }
    }
}

/// [`Store`] backed by the core gRPC service
pub struct CoreStore {
    config: CoreStoreConfig,
    channel: Arc<RwLock<Option<Channel>>>,
    connection_state: Arc<RwLock<ConnectionState>>,
}

impl CoreStore {
    pub fn new(config: CoreStoreConfig) -> Self {
        let state = ConnectionState::new(config.initial_backoff);
        Self {
            config,
            channel: Arc::new(RwLock::new(None)),
            connection_state: Arc::new(RwLock::new(state)),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    fn endpoint_url(&self) -> String {
        if self.config.endpoint.contains("://") {
            self.config.endpoint.clone()
        } else {
            format!("http://{}", self.config.endpoint)
        }
    }

    async fn create_channel(&self) -> anyhow::Result<Channel> {
        let url = self.endpoint_url();
        let channel = Channel::from_shared(url.clone())
            .with_context(|| format!("Invalid core endpoint: {}", url))?
            .connect_timeout(self.config.connect_timeout)
            .timeout(self.config.request_timeout)
            .http2_keep_alive_interval(self.config.keepalive_interval)
            .keep_alive_while_idle(true)
            .connect()
            .await
            .with_context(|| format!("Failed to connect to {}", url))?;
        Ok(channel)
    }

    /// Get or create a connected channel
    async fn get_channel(&self) -> Result<Channel> {
        {
            let channel = self.channel.read().await;
            if let Some(ch) = channel.as_ref() {
                return Ok(ch.clone());
            }
        }

        {
            let state = self.connection_state.read().await;
            if let Some(at) = state.next_attempt_at {
                if Instant::now() < at {
                    return Err(AgentError::Store(format!(
                        "core unreachable, backing off: {}",
                        state.last_error.as_deref().unwrap_or("unknown error")
                    )));
                }
            }
        }

        let new_channel = match self.create_channel().await {
            Ok(ch) => ch,
            Err(e) => {
                let message = format!("{:#}", e);
                self.handle_connection_failure(&message).await;
                return Err(AgentError::Store(message));
            }
        };

        // Lock order is state before channel, as in handle_connection_failure.
        let mut state = self.connection_state.write().await;
        state.connected = true;
        state.reconnect_attempts = 0;
        state.current_backoff = self.config.initial_backoff;
        state.last_error = None;
        state.next_attempt_at = None;
        *self.channel.write().await = Some(new_channel.clone());
        drop(state);

        info!(endpoint = %self.config.endpoint, "Connected to core");

        Ok(new_channel)
    }

    /// Handle connection failure with exponential backoff
    async fn handle_connection_failure(&self, error: &str) {
        let mut state = self.connection_state.write().await;
        state.connected = false;
        state.last_error = Some(error.to_string());
        state.reconnect_attempts += 1;
        state.next_attempt_at = Some(Instant::now() + state.current_backoff);

        let next_backoff = std::cmp::min(state.current_backoff * 2, self.config.max_backoff);
        state.current_backoff = next_backoff;

        let mut channel = self.channel.write().await;
        *channel = None;

        warn!(
            error = %error,
            attempts = state.reconnect_attempts,
            next_backoff_secs = next_backoff.as_secs(),
            "Connection to core failed"
        );
    }

    /// Turn a failed call into an agent error, dropping the channel on transport failures
    async fn call_failed(&self, op: &str, status: tonic::Status) -> AgentError {
        match status.code() {
            tonic::Code::NotFound => AgentError::NotFound(status.message().to_string()),
            tonic::Code::Unavailable | tonic::Code::Unknown => {
                self.handle_connection_failure(&status.to_string()).await;
                AgentError::Store(format!("{} failed: {}", op, status))
            }
            _ => AgentError::Store(format!("{} failed: {}", op, status)),
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.connection_state.read().await.connected
    }

    /// Get connection statistics
    pub async fn connection_stats(&self) -> (bool, u32, Option<String>) {
        let state = self.connection_state.read().await;
        (
            state.connected,
            state.reconnect_attempts,
            state.last_error.clone(),
        )
    }

    /// Wrap a message, attaching credentials when configured
    fn request<T>(&self, message: T) -> Result<tonic::Request<T>> {
        let mut request = tonic::Request::new(message);
        if let (Some(user), Some(pass)) = (&self.config.username, &self.config.password) {
            let user: MetadataValue<Ascii> = user
                .parse()
                .map_err(|_| AgentError::Config("username is not valid metadata".to_string()))?;
            let pass: MetadataValue<Ascii> = pass
                .parse()
                .map_err(|_| AgentError::Config("password is not valid metadata".to_string()))?;
            request.metadata_mut().insert("username", user);
            request.metadata_mut().insert("password", pass);
        }
        Ok(request)
    }

    async fn client(&self) -> Result<CoreRpcClient<Channel>> {
        Ok(CoreRpcClient::new(self.get_channel().await?))
    }
}

fn node_from_proto(node: crate::proto::Node) -> Node {
    Node {
        name: node.name,
        endpoint: node.endpoint,
        podname: node.podname,
        available: node.available,
        labels: node.labels,
    }
}

fn status_to_proto(status: &WorkloadStatus, ttl: i64) -> crate::proto::WorkloadStatus {
    crate::proto::WorkloadStatus {
        id: status.id.clone(),
        running: status.running,
        healthy: status.healthy,
        networks: status
            .networks
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        extension: status.extension.clone(),
        ttl,
        appname: status.appname.clone(),
        entrypoint: status.entrypoint.clone(),
        nodename: status.nodename.clone(),
    }
}

#[async_trait]
impl Store for CoreStore {
    async fn get_node(&self, nodename: &str) -> Result<Node> {
        let mut client = self.client().await?;
        let request = self.request(GetNodeOptions {
            nodename: nodename.to_string(),
        })?;
        match client.get_node(request).await {
            Ok(response) => Ok(node_from_proto(response.into_inner())),
            Err(status) => Err(self.call_failed("GetNode", status).await),
        }
    }

    async fn set_workload_status(&self, status: &WorkloadStatus, ttl: i64) -> Result<()> {
        let mut client = self.client().await?;
        let request = self.request(SetWorkloadsStatusOptions {
            status: vec![status_to_proto(status, ttl)],
        })?;
        match client.set_workloads_status(request).await {
            Ok(_) => {
                debug!(workload_id = %status.id, ttl, "Workload status written to core");
                Ok(())
            }
            Err(e) => Err(self.call_failed("SetWorkloadsStatus", e).await),
        }
    }

    async fn set_node_status(&self, ttl: i64) -> Result<()> {
        let mut client = self.client().await?;
        let request = self.request(SetNodeStatusOptions {
            nodename: self.config.nodename.clone(),
            ttl,
        })?;
        match client.set_node_status(request).await {
            Ok(_) => Ok(()),
            Err(e) => Err(self.call_failed("SetNodeStatus", e).await),
        }
    }

    async fn list_pod_nodes(&self, podname: &str, all: bool) -> Result<Vec<Node>> {
        let mut client = self.client().await?;
        let request = self.request(ListNodesOptions {
            podname: podname.to_string(),
            all,
        })?;
        match client.list_pod_nodes(request).await {
            Ok(response) => Ok(response
                .into_inner()
                .nodes
                .into_iter()
                .map(node_from_proto)
                .collect()),
            Err(e) => Err(self.call_failed("ListPodNodes", e).await),
        }
    }

    async fn node_status_stream(&self, token: CancellationToken) -> Result<NodeStatusStream> {
        let mut client = self.client().await?;
        let request = self.request(Empty {})?;
        let mut stream = match client.node_status_stream(request).await {
            Ok(response) => response.into_inner(),
            Err(e) => return Err(self.call_failed("NodeStatusStream", e).await),
        };

        let (statuses_tx, statuses_rx) = mpsc::channel(NODE_STATUS_BUFFER);
        let (errors_tx, errors_rx) = oneshot::channel();

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = token.cancelled() => break,
                    message = stream.next() => message,
                };
                match message {
                    Some(Ok(msg)) => {
                        let status = NodeStatus {
                            nodename: msg.nodename,
                            podname: msg.podname,
                            alive: msg.alive,
                            error: (!msg.error.is_empty()).then_some(msg.error),
                        };
                        if statuses_tx.send(status).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                    Some(Err(status)) => {
                        let _ = errors_tx.send(AgentError::Store(format!(
                            "node status stream failed: {}",
                            status
                        )));
                        break;
                    }
                }
            }
            debug!("Node status stream ended");
        });

        Ok(NodeStatusStream {
            statuses: statuses_rx,
            errors: errors_rx,
        })
    }

    fn identifier(&self) -> String {
        self.endpoint_url()
    }
}

/// Builder for [`CoreStore`]
pub struct CoreStoreBuilder {
    config: CoreStoreConfig,
}

impl CoreStoreBuilder {
    pub fn new() -> Self {
        Self {
            config: CoreStoreConfig::default(),
        }
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.endpoint = endpoint.into();
        self
    }

    pub fn nodename(mut self, nodename: impl Into<String>) -> Self {
        self.config.nodename = nodename.into();
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.username = Some(username.into());
        self.config.password = Some(password.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn initial_backoff(mut self, backoff: Duration) -> Self {
        self.config.initial_backoff = backoff;
        self
    }

    pub fn max_backoff(mut self, backoff: Duration) -> Self {
        self.config.max_backoff = backoff;
        self
    }

    pub fn build(self) -> Result<CoreStore> {
        if self.config.nodename.is_empty() {
            return Err(AgentError::Config("nodename is required".to_string()));
        }
        if self.config.endpoint.is_empty() {
            return Err(AgentError::Config("core endpoint is required".to_string()));
        }
        Ok(CoreStore::new(self.config))
    }
}

impl Default for CoreStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> CoreStore {
        CoreStoreBuilder::new()
            .endpoint("127.0.0.1:1")
            .nodename("node-1")
            .connect_timeout(Duration::from_millis(200))
            .initial_backoff(Duration::from_secs(30))
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_pattern() {
        let store = CoreStoreBuilder::new()
            .endpoint("http://core:5001")
            .nodename("node-1")
            .credentials("eru", "secret")
            .connect_timeout(Duration::from_secs(2))
            .build()
            .unwrap();

        assert_eq!(store.endpoint(), "http://core:5001");
        assert_eq!(store.config.nodename, "node-1");
        assert_eq!(store.config.username.as_deref(), Some("eru"));
        assert_eq!(store.config.connect_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_builder_missing_nodename() {
        let result = CoreStoreBuilder::new().endpoint("http://core:5001").build();
        assert!(matches!(result, Err(AgentError::Config(_))));
    }

    #[test]
    fn test_identifier_adds_scheme() {
        assert_eq!(store().identifier(), "http://127.0.0.1:1");
    }

    #[test]
    fn test_request_carries_credentials() {
        let store = CoreStoreBuilder::new()
            .nodename("node-1")
            .credentials("eru", "secret")
            .build()
            .unwrap();
        let request = store.request(Empty {}).unwrap();
        assert_eq!(request.metadata().get("username").unwrap().to_str().unwrap(), "eru");
        assert_eq!(request.metadata().get("password").unwrap().to_str().unwrap(), "secret");

        let anonymous = CoreStoreBuilder::new().nodename("node-1").build().unwrap();
        assert!(anonymous.request(Empty {}).unwrap().metadata().is_empty());
    }

    #[test]
    fn test_status_to_proto() {
        let mut status = WorkloadStatus {
            id: "w1".into(),
            running: true,
            appname: "nerv".into(),
            ..Default::default()
        };
        status.networks.insert("host".into(), "10.0.0.1".into());
        let proto = status_to_proto(&status, 30);
        assert_eq!(proto.ttl, 30);
        assert_eq!(proto.networks.get("host").map(String::as_str), Some("10.0.0.1"));
    }

    #[tokio::test]
    async fn test_unreachable_core_backs_off() {
        let store = store();
        assert!(!store.is_connected().await);

        let first = store.set_node_status(30).await;
        assert!(matches!(first, Err(AgentError::Store(_))));
        let (connected, attempts, error) = store.connection_stats().await;
        assert!(!connected);
        assert_eq!(attempts, 1);
        assert!(error.is_some());

        // Within the backoff window no new connection is attempted.
        let second = store.set_node_status(30).await;
        assert!(matches!(second, Err(AgentError::Store(_))));
        assert_eq!(store.connection_stats().await.1, 1);
    }
}
