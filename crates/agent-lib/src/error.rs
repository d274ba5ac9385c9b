//! Error taxonomy for the agent core
//!
//! Callers branch on the sentinel variants only (`NotFound`, `Invalid`,
//! `NotImplemented`, `LockFailed`); everything else is opaque and logged.

use std::time::Duration;
use thiserror::Error;

/// Result alias used across the agent library
pub type Result<T, E = AgentError> = std::result::Result<T, E>;

/// Errors produced by runtime drivers, stores and the reconciliation engine
#[derive(Debug, Error)]
pub enum AgentError {
    /// The workload no longer exists on this host
    #[error("workload {0} not found")]
    NotFound(String),

    /// The workload exists but is not managed by this agent
    #[error("workload {0} is not managed by this agent")]
    Invalid(String),

    /// The active backend lacks this capability
    #[error("{0} is not implemented by this backend")]
    NotImplemented(&'static str),

    /// Another check for the same key is already in flight
    #[error("lock for {0} is already held")]
    LockFailed(String),

    /// A backend or store call did not return in time
    #[error("{op} timed out after {timeout:?}")]
    Timeout { op: &'static str, timeout: Duration },

    /// Runtime backend failure
    #[error("runtime error: {0}")]
    Runtime(String),

    /// Remote store failure
    #[error("store error: {0}")]
    Store(String),

    /// The runtime event subscription ended without an error
    #[error("event stream closed")]
    EventStreamClosed,

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AgentError {
    /// Local, per-workload failures that abort one operation and nothing else
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            AgentError::NotFound(_)
                | AgentError::Invalid(_)
                | AgentError::NotImplemented(_)
                | AgentError::LockFailed(_)
        )
    }

    /// Transient failures worth retrying for idempotent operations
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::Timeout { .. } | AgentError::Runtime(_) | AgentError::Store(_)
        )
    }

    /// Short stable label for logs and metrics
    pub fn as_label(&self) -> &'static str {
        match self {
            AgentError::NotFound(_) => "not_found",
            AgentError::Invalid(_) => "invalid",
            AgentError::NotImplemented(_) => "not_implemented",
            AgentError::LockFailed(_) => "lock_failed",
            AgentError::Timeout { .. } => "timeout",
            AgentError::Runtime(_) => "runtime",
            AgentError::Store(_) => "store",
            AgentError::EventStreamClosed => "event_stream_closed",
            AgentError::Config(_) => "config",
            AgentError::Other(_) => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_soft_errors() {
        assert!(AgentError::NotFound("a".into()).is_soft());
        assert!(AgentError::NotImplemented("attach").is_soft());
        assert!(AgentError::LockFailed("a".into()).is_soft());
        assert!(!AgentError::Store("down".into()).is_soft());
        assert!(!AgentError::EventStreamClosed.is_soft());
    }

    #[test]
    fn test_retryable_errors() {
        let timeout = AgentError::Timeout {
            op: "get_status",
            timeout: Duration::from_secs(1),
        };
        assert!(timeout.is_retryable());
        assert!(AgentError::Store("connection refused".into()).is_retryable());
        assert!(!AgentError::Invalid("a".into()).is_retryable());
        assert_eq!(timeout.as_label(), "timeout");
    }
}
