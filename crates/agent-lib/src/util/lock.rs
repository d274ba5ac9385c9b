//! Fail-fast keyed lock
//!
//! Presence of a key means "in flight". Acquiring an already-held key returns
//! `None` immediately instead of waiting.

use dashmap::DashSet;
use std::sync::Arc;

/// Set of keys currently held
#[derive(Debug, Clone, Default)]
pub struct KeyedLock {
    held: Arc<DashSet<String>>,
}

impl KeyedLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to acquire `key`; the returned guard releases it on drop
    pub fn try_acquire(&self, key: &str) -> Option<KeyedLockGuard> {
        if self.held.insert(key.to_string()) {
            Some(KeyedLockGuard {
                held: Arc::clone(&self.held),
                key: key.to_string(),
            })
        } else {
            None
        }
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held.contains(key)
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

/// Releases its key when dropped
#[derive(Debug)]
pub struct KeyedLockGuard {
    held: Arc<DashSet<String>>,
    key: String,
}

impl KeyedLockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyedLockGuard {
    fn drop(&mut self) {
        self.held.remove(&self.key);
    }
}
