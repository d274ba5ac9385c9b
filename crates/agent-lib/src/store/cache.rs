//! Status-caching store decorator
//!
//! A zero-TTL push whose serialized snapshot equals the last one written for
//! the same workload (within `cache_ttl`) is skipped. Entries are recorded
//! only after the remote write succeeded and only when `cache_ttl` is
//! positive; a zero `cache_ttl` disables suppression entirely.

use super::{NodeStatusStream, Store};
use crate::error::Result;
use crate::models::{Node, WorkloadStatus};
use crate::observability::AgentMetrics;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct CacheEntry {
    snapshot: String,
    expires_at: Instant,
}

/// [`Store`] wrapper that suppresses redundant status writes
pub struct CachedStore {
    inner: Arc<dyn Store>,
    cache_ttl: Duration,
    entries: DashMap<String, CacheEntry>,
    metrics: AgentMetrics,
}

impl CachedStore {
    pub fn new(inner: Arc<dyn Store>, cache_ttl: Duration) -> Self {
        Self {
            inner,
            cache_ttl,
            entries: DashMap::new(),
            metrics: AgentMetrics::new(),
        }
    }

    pub fn inner(&self) -> &Arc<dyn Store> {
        &self.inner
    }

    /// Live (unexpired) cache entries
    pub fn cached_entries(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.expires_at > now).count()
    }

    /// Drop every expired entry, returning how many were removed
    pub fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    fn cache_key(status: &WorkloadStatus) -> String {
        format!("{}{}{}", status.appname, status.id, status.nodename)
    }

    fn is_unchanged(&self, key: &str, snapshot: &str) -> bool {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => return entry.snapshot == snapshot,
            Some(_) => true,
            None => false,
        };
        // The read guard must be released before removing from the same shard.
        if expired {
            self.entries.remove_if(key, |_, e| e.expires_at <= now);
        }
        false
    }
}

#[async_trait]
impl Store for CachedStore {
    async fn get_node(&self, nodename: &str) -> Result<Node> {
        self.inner.get_node(nodename).await
    }

    async fn set_workload_status(&self, status: &WorkloadStatus, ttl: i64) -> Result<()> {
        let key = Self::cache_key(status);

        if ttl != 0 {
            // A TTL-bound write supersedes whatever was cached for this workload.
            self.entries.remove(&key);
            return self.inner.set_workload_status(status, ttl).await;
        }

        let snapshot = serde_json::to_string(status).map_err(anyhow::Error::from)?;
        if self.is_unchanged(&key, &snapshot) {
            debug!(workload_id = %status.id, "Status unchanged, skipping push");
            self.metrics.inc_status_pushes_suppressed();
            return Ok(());
        }

        self.inner.set_workload_status(status, ttl).await?;

        if !self.cache_ttl.is_zero() {
            self.entries.insert(
                key,
                CacheEntry {
                    snapshot,
                    expires_at: Instant::now() + self.cache_ttl,
                },
            );
        }
        Ok(())
    }

    async fn set_node_status(&self, ttl: i64) -> Result<()> {
        self.inner.set_node_status(ttl).await
    }

    async fn list_pod_nodes(&self, podname: &str, all: bool) -> Result<Vec<Node>> {
        self.inner.list_pod_nodes(podname, all).await
    }

    async fn node_status_stream(&self, token: CancellationToken) -> Result<NodeStatusStream> {
        self.inner.node_status_stream(token).await
    }

    fn identifier(&self) -> String {
        self.inner.identifier()
    }
}
