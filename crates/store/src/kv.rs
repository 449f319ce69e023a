// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The persistent key/value contract shared by every execution context.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Identifies one execution context (a tab) writing to a shared store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextId(u64);

impl ContextId {
    /// Changes that originate outside this process (e.g. another process
    /// writing to a shared directory).
    pub const EXTERNAL: ContextId = ContextId(0);

    /// Allocate a process-unique context id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// A write or removal observed in another context.
///
/// `key == None` means an unknown set of keys changed (the store was
/// cleared, or the feed fell behind and dropped events). Consumers must
/// resynchronise from their source of truth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    pub key: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

impl StorageChange {
    pub fn unknown() -> Self {
        Self { key: None, old_value: None, new_value: None }
    }

    pub fn is_removal(&self) -> bool {
        self.key.is_some() && self.new_value.is_none()
    }
}

/// A change tagged with the context that produced it.
#[derive(Debug, Clone)]
pub(crate) struct Announced {
    pub origin: ContextId,
    pub change: StorageChange,
}

/// Synchronous key/value store shared by every tab of one origin.
///
/// Implementations must announce every mutation on the change feed of all
/// *other* contexts, and never to the writing context itself.
pub trait PersistentKv: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String);
    fn remove(&self, key: &str);
    fn keys(&self) -> Vec<String>;
    fn subscribe(&self) -> ChangeFeed;
}

/// Receiving half of a store's change broadcast, filtered to exclude the
/// subscriber's own writes.
pub struct ChangeFeed {
    rx: broadcast::Receiver<Announced>,
    own: ContextId,
}

impl ChangeFeed {
    pub(crate) fn new(rx: broadcast::Receiver<Announced>, own: ContextId) -> Self {
        Self { rx, own }
    }

    /// Wait for the next change written by another context.
    ///
    /// Returns `None` once the store has been dropped.
    pub async fn recv(&mut self) -> Option<StorageChange> {
        loop {
            match self.rx.recv().await {
                Ok(a) if a.origin == self.own => continue,
                Ok(a) => return Some(a.change),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "change feed lagged, forcing resync");
                    return Some(StorageChange::unknown());
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
