// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Token refresh policy and the recurring tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bazaar_store::Clock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::AdapterError;
use crate::identity::{IdentityService, Session};
use crate::state::Input;

/// Two thresholds: refresh quietly inside the long one, warn inside the
/// short one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    pub refresh_window: Duration,
    pub warn_window: Duration,
}

impl RefreshPolicy {
    pub fn remaining(&self, expires_at: u64, now_ms: u64) -> Duration {
        Duration::from_millis(expires_at.saturating_sub(now_ms))
    }

    pub fn is_expired(&self, expires_at: u64, now_ms: u64) -> bool {
        expires_at <= now_ms
    }

    /// Still valid but inside the refresh window.
    pub fn is_due(&self, expires_at: u64, now_ms: u64) -> bool {
        !self.is_expired(expires_at, now_ms)
            && self.remaining(expires_at, now_ms) < self.refresh_window
    }

    /// Still valid but inside the warning window.
    pub fn should_warn(&self, expires_at: u64, now_ms: u64) -> bool {
        !self.is_expired(expires_at, now_ms)
            && self.remaining(expires_at, now_ms) < self.warn_window
    }
}

/// Result of a refresh check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Plenty of time left; the adapter was not called.
    NotDue,
    /// Another refresh from this tab is already running.
    InFlight,
    Refreshed(Session),
    /// Nothing to refresh: no session, an expired one, or the adapter
    /// reported none.
    NoSession,
    Failed(AdapterError),
}

/// Clears the in-flight flag even if the refresh future is dropped.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Decides whether to refresh and calls the adapter at most once at a time.
pub struct TokenRefreshScheduler {
    identity: Arc<dyn IdentityService>,
    clock: Arc<dyn Clock>,
    policy: RefreshPolicy,
    timeout: Duration,
    in_flight: AtomicBool,
}

impl TokenRefreshScheduler {
    pub fn new(
        identity: Arc<dyn IdentityService>,
        clock: Arc<dyn Clock>,
        policy: RefreshPolicy,
        timeout: Duration,
    ) -> Self {
        Self { identity, clock, policy, timeout, in_flight: AtomicBool::new(false) }
    }

    pub fn policy(&self) -> RefreshPolicy {
        self.policy
    }

    /// Refresh `session` if it is inside the refresh window.
    ///
    /// Remaining time is checked before touching the adapter, so a call with
    /// plenty of time left never refreshes. `on_start` runs only when an
    /// adapter call is about to be made.
    pub async fn refresh_if_due(
        &self,
        session: Option<&Session>,
        on_start: impl FnOnce(),
    ) -> RefreshOutcome {
        let Some(session) = session else {
            return RefreshOutcome::NoSession;
        };
        let now = self.clock.now_ms();
        if self.policy.is_expired(session.expires_at, now) {
            return RefreshOutcome::NoSession;
        }
        if !self.policy.is_due(session.expires_at, now) {
            debug!(
                remaining_secs = self.policy.remaining(session.expires_at, now).as_secs(),
                "refresh not due"
            );
            return RefreshOutcome::NotDue;
        }
        if self.in_flight.swap(true, Ordering::AcqRel) {
            return RefreshOutcome::InFlight;
        }
        let _guard = InFlightGuard(&self.in_flight);

        on_start();
        match tokio::time::timeout(self.timeout, self.identity.refresh_session()).await {
            Ok(Ok(Some(refreshed))) => RefreshOutcome::Refreshed(refreshed),
            Ok(Ok(None)) => RefreshOutcome::NoSession,
            Ok(Err(e)) => {
                warn!(err = %e, "token refresh failed");
                RefreshOutcome::Failed(e)
            }
            Err(_) => {
                warn!(timeout_secs = self.timeout.as_secs(), "token refresh timed out");
                RefreshOutcome::Failed(AdapterError::Timeout)
            }
        }
    }
}

/// Post a [`Input::Tick`] every `interval` until `shutdown` fires.
///
/// The first tick comes one interval after start; sign-in does its own
/// marker and refresh bookkeeping.
pub fn spawn_ticker(
    input: mpsc::UnboundedSender<Input>,
    interval: Duration,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut timer = tokio::time::interval_at(start, interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }
            if input.send(Input::Tick { now: clock.now_ms() }).is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
