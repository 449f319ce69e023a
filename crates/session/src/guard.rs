// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Route gating on top of the session snapshot.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::machine::{init_wait_bound, SessionMachine};
use crate::scheduler::RefreshOutcome;
use crate::state::Phase;

/// How much a route cares about the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteKind {
    #[default]
    Public,
    Protected,
    /// Account settings, payments and the like. Also checks token freshness.
    Sensitive,
}

impl std::fmt::Display for RouteKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Public => f.write_str("public"),
            Self::Protected => f.write_str("protected"),
            Self::Sensitive => f.write_str("sensitive"),
        }
    }
}

impl std::str::FromStr for RouteKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "public" => Ok(Self::Public),
            "protected" => Ok(Self::Protected),
            "sensitive" => Ok(Self::Sensitive),
            other => anyhow::bail!("invalid route kind: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardDecision {
    Allow,
    SignIn,
}

impl GuardDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Decide whether the current tab may enter a route of `kind`.
///
/// Waits for initialization to finish, but never longer than the init
/// ceiling plus slack; after that the snapshot is taken as it stands.
pub async fn guard(machine: &SessionMachine, kind: RouteKind) -> GuardDecision {
    if kind == RouteKind::Public {
        return GuardDecision::Allow;
    }

    let bound = init_wait_bound(machine.settings());
    let settled = machine.wait_for(|s| !s.is_initializing && s.phase != Phase::Uninitialized);
    let snapshot = match tokio::time::timeout(bound, settled).await {
        Ok(snapshot) => snapshot,
        Err(_) => {
            warn!(tab = %machine.tab(), route = %kind, "session still initializing, deciding anyway");
            machine.snapshot()
        }
    };
    if !snapshot.is_authenticated {
        return GuardDecision::SignIn;
    }

    if kind == RouteKind::Sensitive {
        match machine.refresh_session().await {
            RefreshOutcome::NoSession => return GuardDecision::SignIn,
            RefreshOutcome::Failed(e) => {
                // The current token stays usable until it actually expires.
                debug!(tab = %machine.tab(), err = %e, "refresh before sensitive route failed");
            }
            _ => {}
        }
    }
    GuardDecision::Allow
}

#[cfg(test)]
#[path = "guard_tests.rs"]
mod tests;
