//! Node liveness reporting
//!
//! The [`NodeManager`] keeps this host marked alive in the store with a
//! TTL'd heartbeat while the runtime daemon is up, and removes the mark on
//! shutdown.

use crate::error::Result;
use crate::health::{components, HealthRegistry};
use crate::models::NodeStatus;
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::runtime::Runtime;
use crate::store::{NodeStatusStream, Store};
use crate::util::{with_timeout, RetryPolicy};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub nodename: String,
    pub heartbeat_interval: Duration,
    /// TTL of each liveness mark, in seconds
    pub node_ttl: i64,
    pub store_timeout: Duration,
    /// Bound on the daemon liveness check
    pub runtime_timeout: Duration,
    pub retry: RetryPolicy,
    /// Bound on the final unregister call
    pub unregister_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            nodename: "localhost".to_string(),
            heartbeat_interval: Duration::from_secs(60),
            node_ttl: 180,
            store_timeout: Duration::from_secs(10),
            runtime_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            unregister_timeout: Duration::from_secs(3),
        }
    }
}

/// Heartbeat and liveness watch for this node
pub struct NodeManager {
    config: NodeConfig,
    runtime: Arc<dyn Runtime>,
    store: Arc<dyn Store>,
    health: HealthRegistry,
    metrics: AgentMetrics,
    logger: StructuredLogger,
}

impl NodeManager {
    pub fn new(
        config: NodeConfig,
        runtime: Arc<dyn Runtime>,
        store: Arc<dyn Store>,
        health: HealthRegistry,
    ) -> Self {
        let logger = StructuredLogger::new(config.nodename.clone());
        Self {
            config,
            runtime,
            store,
            health,
            metrics: AgentMetrics::new(),
            logger,
        }
    }

    /// Heartbeat until `token` is cancelled, then unregister the node
    pub async fn run(&self, token: CancellationToken) {
        match with_timeout(
            "get_node",
            self.config.store_timeout,
            self.store.get_node(&self.config.nodename),
        )
        .await
        {
            Ok(node) => info!(
                podname = %node.podname,
                endpoint = %node.endpoint,
                available = node.available,
                "Node found in store"
            ),
            Err(e) => warn!(error = %e, "Failed to fetch node from store"),
        }

        tokio::join!(self.heartbeat_loop(&token), self.watch(&token));

        match self.unregister().await {
            Ok(()) => info!("Node unregistered"),
            Err(e) => warn!(error = %e, "Failed to unregister node"),
        }
    }

    async fn heartbeat_loop(&self, token: &CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    self.heartbeat(token).await;
                }
            }
        }
    }

    /// Mark the node alive for `node_ttl`. Skipped while the daemon is down
    pub async fn heartbeat(&self, token: &CancellationToken) -> bool {
        if !self.daemon_running().await {
            warn!(runtime = self.runtime.name(), "Runtime daemon not running, skipping heartbeat");
            self.health
                .set_degraded(components::RUNTIME, "daemon not running");
            return false;
        }

        let ttl = self.config.node_ttl;
        let result = self
            .config
            .retry
            .retry_if(
                token,
                |_| with_timeout("set_node_status", self.config.store_timeout, self.store.set_node_status(ttl)),
                |e| e.is_retryable(),
            )
            .await;

        match result {
            Ok(()) => {
                self.metrics.inc_node_heartbeats();
                self.health.set_healthy(components::STORE);
                self.logger.log_heartbeat(ttl, true);
                true
            }
            Err(e) => {
                warn!(error = %e, "Node heartbeat failed");
                self.health.set_degraded(components::STORE, e.to_string());
                self.logger.log_heartbeat(ttl, false);
                false
            }
        }
    }

    /// Re-assert liveness whenever the store reports this node dead while
    /// the daemon is still up. Re-subscribes after the stream ends.
    async fn watch(&self, token: &CancellationToken) {
        loop {
            match self.store.node_status_stream(token.child_token()).await {
                Ok(NodeStatusStream {
                    mut statuses,
                    mut errors,
                }) => {
                    loop {
                        tokio::select! {
                            biased;
                            _ = token.cancelled() => return,
                            status = statuses.recv() => match status {
                                Some(status) => self.on_node_status(status, token).await,
                                None => break,
                            },
                        }
                    }
                    match errors.try_recv() {
                        Ok(e) => warn!(error = %e, "Node status watch failed"),
                        Err(_) => debug!("Node status watch ended"),
                    }
                }
                Err(e) => warn!(error = %e, "Failed to watch node status"),
            }

            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(self.config.heartbeat_interval) => {}
            }
        }
    }

    async fn on_node_status(&self, status: NodeStatus, token: &CancellationToken) {
        if status.nodename != self.config.nodename {
            return;
        }
        if status.alive {
            debug!("Node reported alive");
            return;
        }
        if self.daemon_running().await {
            info!(error = ?status.error, "Node reported down while daemon is running, re-asserting");
            self.heartbeat(token).await;
        }
    }

    /// A daemon that does not answer in time counts as down
    async fn daemon_running(&self) -> bool {
        let check = async { Ok(self.runtime.is_daemon_running().await) };
        match with_timeout("is_daemon_running", self.config.runtime_timeout, check).await {
            Ok(running) => running,
            Err(e) => {
                warn!(error = %e, "Runtime daemon check failed");
                false
            }
        }
    }

    async fn unregister(&self) -> Result<()> {
        with_timeout(
            "set_node_status",
            self.config.unregister_timeout,
            self.store.set_node_status(-1),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MockRuntime;
    use crate::store::MockStore;

    fn config(interval: Duration) -> NodeConfig {
        NodeConfig {
            nodename: "node-1".to_string(),
            heartbeat_interval: interval,
            node_ttl: 30,
            store_timeout: Duration::from_secs(1),
            runtime_timeout: Duration::from_millis(50),
            retry: RetryPolicy::fixed(3, Duration::from_millis(1)),
            unregister_timeout: Duration::from_secs(1),
        }
    }

    fn setup(interval: Duration) -> (Arc<NodeManager>, Arc<MockRuntime>, Arc<MockStore>) {
        let runtime = Arc::new(MockRuntime::new("node-1"));
        let store = Arc::new(MockStore::new("node-1"));
        let manager = NodeManager::new(
            config(interval),
            runtime.clone(),
            store.clone(),
            HealthRegistry::new(),
        );
        (Arc::new(manager), runtime, store)
    }

    fn spawn(manager: &Arc<NodeManager>) -> (CancellationToken, tokio::task::JoinHandle<()>) {
        let token = CancellationToken::new();
        let handle = {
            let (manager, token) = (manager.clone(), token.clone());
            tokio::spawn(async move { manager.run(token).await })
        };
        (token, handle)
    }

    async fn wait_for<F: FnMut() -> bool>(mut cond: F) -> bool {
        for _ in 0..400 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_heartbeats_then_unregisters() {
        let (manager, _runtime, store) = setup(Duration::from_millis(20));
        let (token, handle) = spawn(&manager);

        assert!(wait_for(|| store.node_ttls().len() >= 2).await);
        token.cancel();
        handle.await.unwrap();

        let ttls = store.node_ttls();
        assert_eq!(ttls.last(), Some(&-1));
        assert!(ttls[..ttls.len() - 1].iter().all(|ttl| *ttl == 30));
        let node = store.get_node("node-1").await.unwrap();
        assert!(!node.available);
    }

    #[tokio::test]
    async fn test_heartbeat_skipped_while_daemon_down() {
        let (manager, runtime, store) = setup(Duration::from_millis(10));
        runtime.set_daemon_running(false);
        let (token, handle) = spawn(&manager);

        tokio::time::sleep(Duration::from_millis(60)).await;
        token.cancel();
        handle.await.unwrap();

        assert_eq!(store.node_ttls(), vec![-1]);
    }

    #[tokio::test]
    async fn test_heartbeat_skipped_while_daemon_hangs() {
        let (manager, runtime, store) = setup(Duration::from_secs(60));
        runtime.set_daemon_delay(Duration::from_secs(5));
        let token = CancellationToken::new();

        let started = std::time::Instant::now();
        assert!(!manager.heartbeat(&token).await);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(store.node_ttls().is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_retries_transient_failures() {
        let (manager, _runtime, store) = setup(Duration::from_secs(60));
        let token = CancellationToken::new();

        store.fail_next(2);
        assert!(manager.heartbeat(&token).await);
        assert_eq!(store.node_ttls(), vec![30]);

        store.fail_next(5);
        assert!(!manager.heartbeat(&token).await);
        assert_eq!(store.node_ttls().len(), 1);
    }

    #[tokio::test]
    async fn test_dead_report_is_reasserted() {
        let (manager, _runtime, store) = setup(Duration::from_secs(3600));
        let (token, handle) = spawn(&manager);
        assert!(wait_for(|| store.node_ttls().len() == 1).await);

        let dead = |nodename: &str| NodeStatus {
            nodename: nodename.to_string(),
            podname: "default".to_string(),
            alive: false,
            error: Some("ttl expired".to_string()),
        };
        assert!(
            wait_for(|| {
                store.publish_node_status(dead("node-1"));
                store.node_ttls().len() >= 2
            })
            .await
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        let settled = store.node_ttls().len();
        store.publish_node_status(dead("node-2"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.node_ttls().len(), settled);

        token.cancel();
        handle.await.unwrap();
    }
}
