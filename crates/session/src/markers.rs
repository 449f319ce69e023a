// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Soft liveness markers: one per signed-in session fingerprint.
//!
//! Each tab writes a marker for its own fingerprint and reads everyone's to
//! tell whether another session is live. There is no compare-and-set, so two
//! tabs can both see "nobody else" before either write lands; callers treat
//! the answer as a hint.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use bazaar_store::ExpiringStorage;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::fingerprint::Fingerprint;

/// Namespace of marker keys in the shared store.
pub const MARKER_PREFIX: &str = "session.active.";

pub fn marker_key(fp: &Fingerprint) -> String {
    format!("{MARKER_PREFIX}{fp}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSessionMarker {
    pub fingerprint: Fingerprint,
    /// Creation time, epoch ms.
    pub timestamp: u64,
    /// Last renewal, epoch ms.
    pub last_active: u64,
}

/// Writes this tab's markers and scans for others'.
#[derive(Clone)]
pub struct MultiSessionDetector {
    storage: ExpiringStorage,
    staleness: Duration,
    owned: Arc<Mutex<BTreeSet<Fingerprint>>>,
}

impl MultiSessionDetector {
    /// `staleness` doubles as the marker TTL, so an abandoned marker expires
    /// on its own and is reclaimed by the next read or sweep.
    pub fn new(storage: ExpiringStorage, staleness: Duration) -> Self {
        Self { storage, staleness, owned: Arc::new(Mutex::new(BTreeSet::new())) }
    }

    /// Write a fresh marker for `fp`.
    pub fn register(&self, fp: &Fingerprint) {
        let now = self.storage.now_ms();
        self.write(ActiveSessionMarker { fingerprint: fp.clone(), timestamp: now, last_active: now });
        debug!(fingerprint = %fp, "registered session marker");
    }

    /// Bump `last_active` on the marker for `fp`, keeping its creation time.
    pub fn renew(&self, fp: &Fingerprint) {
        let now = self.storage.now_ms();
        let timestamp = self
            .storage
            .get::<ActiveSessionMarker>(&marker_key(fp))
            .map(|m| m.timestamp)
            .unwrap_or(now);
        self.write(ActiveSessionMarker { fingerprint: fp.clone(), timestamp, last_active: now });
    }

    fn write(&self, marker: ActiveSessionMarker) {
        self.storage.set(&marker_key(&marker.fingerprint), &marker, Some(self.staleness));
        self.owned.lock().insert(marker.fingerprint);
    }

    /// Remove the marker for `fp` if this detector wrote it. Returns whether
    /// anything was removed.
    pub fn remove_own(&self, fp: &Fingerprint) -> bool {
        if !self.owned.lock().remove(fp) {
            debug!(fingerprint = %fp, "not removing marker this tab did not write");
            return false;
        }
        self.storage.remove(&marker_key(fp));
        debug!(fingerprint = %fp, "removed session marker");
        true
    }

    /// Remove every marker this detector wrote.
    pub fn remove_all_own(&self) {
        let owned = std::mem::take(&mut *self.owned.lock());
        for fp in &owned {
            self.storage.remove(&marker_key(fp));
        }
        if !owned.is_empty() {
            debug!(count = owned.len(), "removed own session markers");
        }
    }

    pub fn owns(&self, fp: &Fingerprint) -> bool {
        self.owned.lock().contains(fp)
    }

    /// Live markers, in key order.
    pub fn active_markers(&self) -> Vec<ActiveSessionMarker> {
        let now = self.storage.now_ms();
        let bound = self.staleness.as_millis() as u64;
        self.storage
            .entries_with_prefix::<ActiveSessionMarker>(MARKER_PREFIX)
            .into_iter()
            .map(|(_, entry)| entry.value)
            .filter(|m| now.saturating_sub(m.last_active) <= bound)
            .collect()
    }

    /// Renew this tab's marker, then report whether any live marker belongs
    /// to a different fingerprint.
    pub fn check_for_other_sessions(&self, fp: &Fingerprint) -> bool {
        self.renew(fp);
        let others = self.active_markers().into_iter().filter(|m| &m.fingerprint != fp).count();
        if others > 0 {
            debug!(fingerprint = %fp, others, "other live sessions");
        }
        others > 0
    }
}

#[cfg(test)]
#[path = "markers_tests.rs"]
mod tests;
