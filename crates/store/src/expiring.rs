// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Expiring envelopes over a [`PersistentKv`].
//!
//! Every value written through [`ExpiringStorage`] is wrapped in an
//! [`ExpiringEntry`]. Reads of an expired or malformed entry behave as if the
//! key were absent and delete it; [`ExpiringStorage::sweep`] reclaims expired
//! entries nobody reads any more, plus malformed ones under
//! [`ENVELOPE_NAMESPACE`].

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::kv::PersistentKv;

/// Keys under this prefix are always envelopes, so anything else found there
/// is corrupt.
pub const ENVELOPE_NAMESPACE: &str = "session.";

/// Stored envelope. Times are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiringEntry<T> {
    pub value: T,
    pub expiry: Option<u64>,
    pub timestamp: u64,
}

impl<T> ExpiringEntry<T> {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expiry.is_some_and(|e| e <= now_ms)
    }
}

/// Envelope-aware view over a shared store.
#[derive(Clone)]
pub struct ExpiringStorage {
    kv: Arc<dyn PersistentKv>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ExpiringStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpiringStorage").field("now_ms", &self.clock.now_ms()).finish()
    }
}

impl ExpiringStorage {
    pub fn new(kv: Arc<dyn PersistentKv>, clock: Arc<dyn Clock>) -> Self {
        Self { kv, clock }
    }

    pub fn kv(&self) -> &Arc<dyn PersistentKv> {
        &self.kv
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Wrap `value` in an envelope and write it through. `ttl: None` never
    /// expires.
    pub fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        let now = self.clock.now_ms();
        let entry = ExpiringEntry {
            value,
            expiry: ttl.map(|t| now.saturating_add(t.as_millis() as u64)),
            timestamp: now,
        };
        match serde_json::to_string(&entry) {
            Ok(json) => self.kv.set(key, json),
            Err(e) => warn!(key, "failed to serialize entry: {e}"),
        }
    }

    /// [`set`](Self::set) with the TTL given in (fractional) hours. Negative
    /// or non-finite hours store an already-expired entry.
    pub fn set_ttl_hours<T: Serialize>(&self, key: &str, value: &T, ttl_hours: Option<f64>) {
        let ttl = ttl_hours
            .map(|h| Duration::try_from_secs_f64(h * 3600.0).unwrap_or(Duration::ZERO));
        self.set(key, value, ttl);
    }

    /// Read the full envelope, purging it if expired or malformed.
    pub fn get_entry<T: DeserializeOwned>(&self, key: &str) -> Option<ExpiringEntry<T>> {
        let raw = self.kv.get(key)?;
        let entry: ExpiringEntry<T> = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key, "dropping malformed entry: {e}");
                self.kv.remove(key);
                return None;
            }
        };
        if entry.is_expired(self.clock.now_ms()) {
            debug!(key, "dropping expired entry");
            self.kv.remove(key);
            return None;
        }
        Some(entry)
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_entry(key).map(|e| e.value)
    }

    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    pub fn remove(&self, key: &str) {
        self.kv.remove(key);
    }

    /// Live entries whose key starts with `prefix`, in key order.
    pub fn entries_with_prefix<T: DeserializeOwned>(
        &self,
        prefix: &str,
    ) -> Vec<(String, ExpiringEntry<T>)> {
        let mut keys: Vec<String> =
            self.kv.keys().into_iter().filter(|k| k.starts_with(prefix)).collect();
        keys.sort();
        keys.into_iter()
            .filter_map(|key| {
                let entry = self.get_entry(&key)?;
                Some((key, entry))
            })
            .collect()
    }

    /// Delete every envelope whose expiry has passed, and every malformed
    /// value under [`ENVELOPE_NAMESPACE`]. Other non-envelope values (keys
    /// owned by other writers) are left alone.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_ms();
        let mut removed = 0;
        for key in self.kv.keys() {
            let Some(raw) = self.kv.get(&key) else {
                continue;
            };
            let entry = match serde_json::from_str::<ExpiringEntry<serde_json::Value>>(&raw) {
                Ok(entry) => entry,
                Err(e) if key.starts_with(ENVELOPE_NAMESPACE) => {
                    warn!(key, "sweeping malformed entry: {e}");
                    self.kv.remove(&key);
                    removed += 1;
                    continue;
                }
                Err(_) => continue,
            };
            if entry.is_expired(now) {
                self.kv.remove(&key);
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "swept stale entries");
        }
        removed
    }
}

/// Sweep once immediately, then every `interval` until `shutdown` fires.
pub fn spawn_sweeper(
    storage: ExpiringStorage,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }
            storage.sweep();
        }
    })
}

#[cfg(test)]
#[path = "expiring_tests.rs"]
mod tests;
