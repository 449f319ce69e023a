// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-process store shared between any number of simulated tabs.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::kv::{Announced, ChangeFeed, ContextId, PersistentKv, StorageChange};

/// Capacity of the change broadcast. Slow subscribers that fall further
/// behind receive a resync marker instead of the missed changes.
const CHANGE_CHANNEL_CAPACITY: usize = 256;

struct Origin {
    entries: RwLock<BTreeMap<String, String>>,
    change_tx: broadcast::Sender<Announced>,
}

/// One context's handle on an in-memory origin.
///
/// Cloning keeps the same context; [`MemoryKv::context`] opens a new one
/// (another tab) on the same underlying data.
#[derive(Clone)]
pub struct MemoryKv {
    origin: Arc<Origin>,
    id: ContextId,
}

impl std::fmt::Debug for MemoryKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryKv")
            .field("id", &self.id)
            .field("keys", &self.origin.entries.read().len())
            .field("subscribers", &self.origin.change_tx.receiver_count())
            .finish()
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKv {
    /// Create a fresh origin and its first context.
    pub fn new() -> Self {
        let (change_tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            origin: Arc::new(Origin { entries: RwLock::new(BTreeMap::new()), change_tx }),
            id: ContextId::next(),
        }
    }

    /// Open another context on the same origin.
    pub fn context(&self) -> Self {
        Self { origin: Arc::clone(&self.origin), id: ContextId::next() }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Remove every key. Other contexts observe a single keyless change.
    pub fn clear(&self) {
        let had_entries = {
            let mut entries = self.origin.entries.write();
            let had = !entries.is_empty();
            entries.clear();
            had
        };
        if had_entries {
            self.announce(StorageChange::unknown());
        }
    }

    fn announce(&self, change: StorageChange) {
        // No receivers is fine: nobody else is listening yet.
        let _ = self.origin.change_tx.send(Announced { origin: self.id, change });
    }
}

impl PersistentKv for MemoryKv {
    fn get(&self, key: &str) -> Option<String> {
        self.origin.entries.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: String) {
        let old = self.origin.entries.write().insert(key.to_owned(), value.clone());
        if old.as_deref() == Some(value.as_str()) {
            return;
        }
        self.announce(StorageChange {
            key: Some(key.to_owned()),
            old_value: old,
            new_value: Some(value),
        });
    }

    fn remove(&self, key: &str) {
        let old = self.origin.entries.write().remove(key);
        if old.is_some() {
            self.announce(StorageChange {
                key: Some(key.to_owned()),
                old_value: old,
                new_value: None,
            });
        }
    }

    fn keys(&self) -> Vec<String> {
        self.origin.entries.read().keys().cloned().collect()
    }

    fn subscribe(&self) -> ChangeFeed {
        ChangeFeed::new(self.origin.change_tx.subscribe(), self.id)
    }
}

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;
