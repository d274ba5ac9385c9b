//! In-memory store that records every write
//!
//! Used by the test suite and selectable as store type `mock` for dry runs.

use super::{NodeStatusStream, Store};
use crate::error::{AgentError, Result};
use crate::models::{Node, NodeStatus, WorkloadStatus};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

const STATUS_BUFFER: usize = 64;

/// One recorded `set_workload_status` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusWrite {
    pub status: WorkloadStatus,
    pub ttl: i64,
}

struct Watcher {
    token: CancellationToken,
    statuses: mpsc::Sender<NodeStatus>,
    errors: Option<oneshot::Sender<AgentError>>,
}

/// Recording store
pub struct MockStore {
    nodename: String,
    nodes: DashMap<String, Node>,
    writes: Mutex<Vec<StatusWrite>>,
    node_ttls: Mutex<Vec<i64>>,
    failing: DashSet<String>,
    unavailable: AtomicBool,
    transient_failures: AtomicUsize,
    watchers: Mutex<Vec<Watcher>>,
}

impl MockStore {
    pub fn new(nodename: &str) -> Self {
        let store = Self {
            nodename: nodename.to_string(),
            nodes: DashMap::new(),
            writes: Mutex::new(Vec::new()),
            node_ttls: Mutex::new(Vec::new()),
            failing: DashSet::new(),
            unavailable: AtomicBool::new(false),
            transient_failures: AtomicUsize::new(0),
            watchers: Mutex::new(Vec::new()),
        };
        store.add_node(Node {
            name: nodename.to_string(),
            endpoint: "unix:///var/run/docker.sock".to_string(),
            podname: "default".to_string(),
            available: true,
            ..Default::default()
        });
        store
    }

    pub fn add_node(&self, node: Node) {
        self.nodes.insert(node.name.clone(), node);
    }

    /// Reject every status write for `id`
    pub fn fail_workload(&self, id: &str) {
        self.failing.insert(id.to_string());
    }

    /// Simulate the whole store being unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `n` writes (status or node) with a transient error
    pub fn fail_next(&self, n: usize) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    pub fn writes(&self) -> Vec<StatusWrite> {
        lock(&self.writes).clone()
    }

    /// Writes recorded for one workload, oldest first
    pub fn writes_for(&self, id: &str) -> Vec<StatusWrite> {
        lock(&self.writes)
            .iter()
            .filter(|w| w.status.id == id)
            .cloned()
            .collect()
    }

    pub fn last_status(&self, id: &str) -> Option<WorkloadStatus> {
        lock(&self.writes)
            .iter()
            .rev()
            .find(|w| w.status.id == id)
            .map(|w| w.status.clone())
    }

    /// TTLs passed to `set_node_status`, oldest first
    pub fn node_ttls(&self) -> Vec<i64> {
        lock(&self.node_ttls).clone()
    }

    /// Deliver a liveness change to every watcher
    pub fn publish_node_status(&self, status: NodeStatus) {
        let mut watchers = lock(&self.watchers);
        watchers.retain(|w| !w.token.is_cancelled() && !w.statuses.is_closed());
        for watcher in watchers.iter() {
            let _ = watcher.statuses.try_send(status.clone());
        }
    }

    /// Terminate every watch with `error`
    pub fn fail_watchers(&self, error: impl Fn() -> AgentError) {
        for mut watcher in lock(&self.watchers).drain(..) {
            if let Some(tx) = watcher.errors.take() {
                let _ = tx.send(error());
            }
        }
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AgentError::Store("store unavailable".to_string()));
        }
        let consumed = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            return Err(AgentError::Store("injected transient failure".to_string()));
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[async_trait]
impl Store for MockStore {
    async fn get_node(&self, nodename: &str) -> Result<Node> {
        self.check_available()?;
        self.nodes
            .get(nodename)
            .map(|n| n.clone())
            .ok_or_else(|| AgentError::NotFound(nodename.to_string()))
    }

    async fn set_workload_status(&self, status: &WorkloadStatus, ttl: i64) -> Result<()> {
        self.check_available()?;
        if self.failing.contains(&status.id) {
            return Err(AgentError::Store(format!("rejected status for {}", status.id)));
        }
        lock(&self.writes).push(StatusWrite {
            status: status.clone(),
            ttl,
        });
        Ok(())
    }

    async fn set_node_status(&self, ttl: i64) -> Result<()> {
        self.check_available()?;
        lock(&self.node_ttls).push(ttl);
        if let Some(mut node) = self.nodes.get_mut(&self.nodename) {
            node.available = ttl >= 0;
        }
        Ok(())
    }

    async fn list_pod_nodes(&self, podname: &str, all: bool) -> Result<Vec<Node>> {
        self.check_available()?;
        let mut nodes: Vec<Node> = self
            .nodes
            .iter()
            .filter(|n| n.podname == podname && (all || n.available))
            .map(|n| n.clone())
            .collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(nodes)
    }

    async fn node_status_stream(&self, token: CancellationToken) -> Result<NodeStatusStream> {
        self.check_available()?;
        let (statuses_tx, statuses_rx) = mpsc::channel(STATUS_BUFFER);
        let (errors_tx, errors_rx) = oneshot::channel();
        lock(&self.watchers).push(Watcher {
            token,
            statuses: statuses_tx,
            errors: Some(errors_tx),
        });
        Ok(NodeStatusStream {
            statuses: statuses_rx,
            errors: errors_rx,
        })
    }

    fn identifier(&self) -> String {
        format!("mock://{}", self.nodename)
    }
}
