// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cross-tab reconciliation.
//!
//! Watches the shared store for writes made by other tabs. A relevant change
//! is only a hint that something moved: the machine re-reads the session
//! from the identity adapter instead of trusting the written value.

use bazaar_store::{ChangeFeed, StorageChange};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument};

use crate::machine::SessionMachine;
use crate::markers::MARKER_PREFIX;
use crate::state::ReconcileTrigger;

/// Which keys count as session-relevant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyFilter {
    pub exact: Vec<String>,
    pub prefixes: Vec<String>,
}

impl KeyFilter {
    /// The adapter's token key (if it has one) plus every marker key.
    pub fn for_session(storage_key: Option<String>) -> Self {
        Self { exact: storage_key.into_iter().collect(), prefixes: vec![MARKER_PREFIX.to_owned()] }
    }

    /// A change with no key means "unknown keys changed" and always counts.
    pub fn is_relevant(&self, change: &StorageChange) -> bool {
        let Some(key) = change.key.as_deref() else {
            return true;
        };
        self.exact.iter().any(|k| k == key) || self.prefixes.iter().any(|p| key.starts_with(p))
    }
}

/// Reconcile `machine` whenever another tab writes a relevant key.
pub fn spawn(
    mut feed: ChangeFeed,
    filter: KeyFilter,
    machine: SessionMachine,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let span = tracing::debug_span!("broadcaster", tab = %machine.tab());
    tokio::spawn(
        async move {
            loop {
                let change = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    change = feed.recv() => change,
                };
                let Some(change) = change else {
                    debug!("change feed closed");
                    break;
                };
                if !filter.is_relevant(&change) {
                    continue;
                }
                debug!(
                    key = change.key.as_deref().unwrap_or("*"),
                    removed = change.is_removal(),
                    "external session change"
                );
                machine.reconcile(ReconcileTrigger::Storage);
            }
        }
        .instrument(span),
    )
}

#[cfg(test)]
#[path = "broadcaster_tests.rs"]
mod tests;
