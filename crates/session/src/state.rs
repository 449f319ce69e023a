// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pure session state transitions.
//!
//! [`reduce`] maps the current state and one input to the next state plus
//! the effects the runtime must perform. Nothing here touches the adapter,
//! the store or a clock, so every transition is testable in isolation.

use std::fmt;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::AdapterError;
use crate::events::Notice;
use crate::fingerprint::Fingerprint;
use crate::identity::{AuthEvent, AuthEventKind, IdentityClaims, Session};
use crate::profile::{merge, PartialProfile, Profile, ProfileSource};
use crate::scheduler::{RefreshOutcome, RefreshPolicy};

/// Lifecycle phase of one tab's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Uninitialized,
    Initializing,
    Authenticated,
    /// Authenticated with a refresh call outstanding.
    Refreshing,
    Unauthenticated,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Authenticated => "authenticated",
            Self::Refreshing => "refreshing",
            Self::Unauthenticated => "unauthenticated",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the adapter is being asked for the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileTrigger {
    /// First answer after start.
    Initial,
    /// Another tab wrote a session-relevant key.
    Storage,
    /// Periodic retry while the answer is unconfirmed.
    Tick,
    /// The held session ran past its expiry.
    Expired,
    /// Requested by a caller, e.g. a route guard.
    Manual,
}

impl ReconcileTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Storage => "storage",
            Self::Tick => "tick",
            Self::Expired => "expired",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for ReconcileTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything that can happen to a tab's session.
#[derive(Debug, Clone)]
pub enum Input {
    Start { cached_profile: Option<Profile> },
    /// Pushed by the identity adapter, in emission order.
    Auth(AuthEvent),
    /// The initialization ceiling elapsed.
    InitTimeout,
    Tick { now: u64 },
    RefreshStarted,
    RefreshFinished(RefreshOutcome),
    ReconcileRequested(ReconcileTrigger),
    /// Answer to an [`Effect::Reconcile`], tagged with the generation it was
    /// issued under.
    Reconciled {
        trigger: ReconcileTrigger,
        generation: u64,
        result: Result<Option<Session>, AdapterError>,
    },
    ProfileLoaded { user_id: String, source: ProfileSource },
    OtherSessions { fingerprint: Fingerprint, present: bool },
    /// A local logout is about to call the adapter.
    SignOutRequested,
    /// A local logout finished, whatever the adapter said.
    LocalSignOut,
}

/// Side effects requested by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    FetchProfile { user_id: String, claims: IdentityClaims },
    WriteProfileCache(Profile),
    ClearProfileCache,
    RegisterMarker(Fingerprint),
    RemoveMarker(Fingerprint),
    CheckOtherSessions(Fingerprint),
    Refresh,
    Reconcile { trigger: ReconcileTrigger, generation: u64 },
    Notify(Notice),
}

/// Thresholds the reducer needs.
#[derive(Debug, Clone, Copy)]
pub struct Policy {
    pub refresh: RefreshPolicy,
    pub unreachable_notice_after: u32,
}

/// Authoritative in-tab belief about the session.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub phase: Phase,
    pub session: Option<Session>,
    pub fingerprint: Option<Fingerprint>,
    pub user: Option<Profile>,
    pub is_initializing: bool,
    /// The adapter has answered at least once since the last identity change.
    pub confirmed: bool,
    /// Advances on every identity change; older pulls are discarded.
    pub generation: u64,
    pub expiring_soon: bool,
    pub has_other_sessions: bool,
    pub unreachable_streak: u32,
    /// A local logout is in progress.
    pub signing_out: bool,
    /// Optimistic profile from the previous visit. Rendering hint only.
    pub cached_profile: Option<Profile>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            phase: Phase::Uninitialized,
            session: None,
            fingerprint: None,
            user: None,
            is_initializing: false,
            confirmed: false,
            generation: 0,
            expiring_soon: false,
            has_other_sessions: false,
            unreachable_streak: 0,
            signing_out: false,
            cached_profile: None,
        }
    }
}

impl SessionState {
    pub fn is_authenticated(&self) -> bool {
        matches!(self.phase, Phase::Authenticated | Phase::Refreshing) && self.session.is_some()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            phase: self.phase,
            user: self.user.clone(),
            is_authenticated: self.is_authenticated(),
            is_initializing: self.is_initializing,
            session_expiry: self.session.as_ref().map(|s| s.expires_at),
            fingerprint: self.fingerprint.clone(),
            expiring_soon: self.expiring_soon,
            has_other_sessions: self.has_other_sessions,
            cached_profile: self.cached_profile.clone(),
        }
    }
}

/// Read-only view handed to the rest of the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub phase: Phase,
    pub user: Option<Profile>,
    pub is_authenticated: bool,
    pub is_initializing: bool,
    /// Epoch ms.
    pub session_expiry: Option<u64>,
    pub fingerprint: Option<Fingerprint>,
    pub expiring_soon: bool,
    pub has_other_sessions: bool,
    /// Non-authoritative; never use for authorization.
    pub cached_profile: Option<Profile>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        SessionState::default().snapshot()
    }
}

/// Next state and the effects that go with it.
#[derive(Debug)]
pub struct Transition {
    pub state: SessionState,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn unchanged(state: SessionState) -> Self {
        Self { state, effects: Vec::new() }
    }
}

/// Apply one input.
pub fn reduce(state: SessionState, input: Input, policy: &Policy) -> Transition {
    let mut state = state;
    let mut effects = Vec::new();

    match input {
        Input::Start { cached_profile } => {
            if state.phase != Phase::Uninitialized {
                return Transition::unchanged(state);
            }
            state.phase = Phase::Initializing;
            state.is_initializing = true;
            state.cached_profile = cached_profile;
            effects.push(Effect::Reconcile {
                trigger: ReconcileTrigger::Initial,
                generation: state.generation,
            });
        }

        Input::Auth(event) => apply_auth_event(&mut state, event, &mut effects),

        Input::InitTimeout => {
            if state.is_initializing {
                warn!("identity did not answer in time, continuing unconfirmed");
                state.is_initializing = false;
                if state.phase == Phase::Initializing {
                    state.phase = Phase::Unauthenticated;
                }
            }
        }

        Input::Tick { now } => on_tick(&mut state, now, policy, &mut effects),

        Input::RefreshStarted => {
            if state.phase == Phase::Authenticated {
                state.phase = Phase::Refreshing;
            }
        }

        Input::RefreshFinished(outcome) => {
            if state.phase == Phase::Refreshing {
                state.phase = Phase::Authenticated;
            }
            match outcome {
                RefreshOutcome::Refreshed(session) => {
                    // The adapter also emits TOKEN_REFRESHED; applying the
                    // same session twice is a no-op.
                    apply_auth_event(
                        &mut state,
                        AuthEvent::new(AuthEventKind::TokenRefreshed, Some(session)),
                        &mut effects,
                    );
                }
                RefreshOutcome::Failed(AdapterError::InvalidGrant(_)) => {
                    // The adapter signs out on a rejected refresh token.
                }
                RefreshOutcome::Failed(e) => {
                    effects.push(Effect::Notify(Notice::RefreshFailed { message: e.to_string() }));
                }
                RefreshOutcome::NoSession if state.is_authenticated() => {
                    effects.push(Effect::Reconcile {
                        trigger: ReconcileTrigger::Expired,
                        generation: state.generation,
                    });
                }
                RefreshOutcome::NoSession | RefreshOutcome::NotDue | RefreshOutcome::InFlight => {}
            }
        }

        Input::ReconcileRequested(trigger) => {
            effects.push(Effect::Reconcile { trigger, generation: state.generation });
        }

        Input::Reconciled { trigger, generation, result } => {
            if generation != state.generation {
                debug!(
                    %trigger,
                    issued = generation,
                    current = state.generation,
                    "dropping stale session pull"
                );
                return Transition::unchanged(state);
            }
            apply_pulled(&mut state, trigger, result, policy, &mut effects);
        }

        Input::ProfileLoaded { user_id, source } => {
            let Some(session) = state.session.as_ref() else {
                return Transition::unchanged(state);
            };
            if session.user_id != user_id {
                return Transition::unchanged(state);
            }
            let profile = merge(&user_id, source, &session.claims);
            state.user = Some(profile.clone());
            state.cached_profile = Some(profile.clone());
            effects.push(Effect::WriteProfileCache(profile));
        }

        Input::OtherSessions { fingerprint, present } => {
            if state.fingerprint.as_ref() != Some(&fingerprint) || !state.is_authenticated() {
                return Transition::unchanged(state);
            }
            if present && !state.has_other_sessions {
                effects.push(Effect::Notify(Notice::OtherSessionsActive));
            }
            state.has_other_sessions = present;
        }

        Input::SignOutRequested => {
            state.signing_out = true;
        }

        Input::LocalSignOut => {
            state.signing_out = false;
            if state.session.is_some() {
                clear_session(&mut state, &mut effects);
            } else {
                forget_cached_profile(&mut state, &mut effects);
            }
            state.phase = Phase::Unauthenticated;
            state.is_initializing = false;
            state.confirmed = true;
        }
    }

    Transition { state, effects }
}

fn initial_user(session: &Session) -> Profile {
    let partial = PartialProfile::from_claims(&session.claims);
    merge(&session.user_id, ProfileSource::FromClaims(partial), &session.claims)
}

/// Take `session` as this tab's session.
///
/// Only a rotation retires the previous marker. A session replaced by a new
/// sign-in may still be live in another tab, so its marker ages out instead.
fn adopt(state: &mut SessionState, session: Session, rotated: bool, effects: &mut Vec<Effect>) {
    let fp = Fingerprint::from_token(&session.access_token);
    let previous_user = state.session.as_ref().map(|s| s.user_id.clone());
    if let Some(old) = state.fingerprint.take() {
        if rotated && old != fp && previous_user.as_deref() == Some(session.user_id.as_str()) {
            effects.push(Effect::RemoveMarker(old));
        }
    }

    let user_changed = previous_user.as_deref() != Some(session.user_id.as_str());
    if user_changed || state.user.is_none() {
        state.user = Some(initial_user(&session));
        state.has_other_sessions = false;
        effects.push(Effect::FetchProfile {
            user_id: session.user_id.clone(),
            claims: session.claims.clone(),
        });
    }

    effects.push(Effect::RegisterMarker(fp.clone()));
    effects.push(Effect::CheckOtherSessions(fp.clone()));

    info!(fingerprint = %fp, user = %session.user_id, "session adopted");
    state.session = Some(session);
    state.fingerprint = Some(fp);
    state.phase = Phase::Authenticated;
    state.is_initializing = false;
    state.confirmed = true;
    state.expiring_soon = false;
    state.unreachable_streak = 0;
    state.generation += 1;
}

/// Drop the session, this tab's marker for it, and the cached profile.
fn clear_session(state: &mut SessionState, effects: &mut Vec<Effect>) {
    if let Some(fp) = state.fingerprint.take() {
        effects.push(Effect::RemoveMarker(fp));
    }
    forget_cached_profile(state, effects);
    info!("session cleared");
    state.session = None;
    state.user = None;
    state.phase = Phase::Unauthenticated;
    state.is_initializing = false;
    state.confirmed = true;
    state.expiring_soon = false;
    state.has_other_sessions = false;
    state.generation += 1;
}

fn forget_cached_profile(state: &mut SessionState, effects: &mut Vec<Effect>) {
    state.cached_profile = None;
    effects.push(Effect::ClearProfileCache);
}

fn same_token(state: &SessionState, session: &Session) -> bool {
    state.session.as_ref().is_some_and(|s| s.access_token == session.access_token)
}

fn apply_auth_event(state: &mut SessionState, event: AuthEvent, effects: &mut Vec<Effect>) {
    debug!(event = %event.kind, phase = %state.phase, "auth event");
    match (event.kind, event.session) {
        (kind @ (AuthEventKind::SignedIn | AuthEventKind::TokenRefreshed), Some(session)) => {
            if same_token(state, &session) && state.is_authenticated() {
                state.is_initializing = false;
                return;
            }
            adopt(state, session, kind == AuthEventKind::TokenRefreshed, effects);
        }
        (AuthEventKind::UserUpdated, Some(session)) => {
            if !state.is_authenticated() || !same_token(state, &session) {
                adopt(state, session, false, effects);
                return;
            }
            effects.push(Effect::FetchProfile {
                user_id: session.user_id.clone(),
                claims: session.claims.clone(),
            });
            state.session = Some(session);
            state.generation += 1;
        }
        (AuthEventKind::SignedOut, _) => {
            let was_authenticated = state.is_authenticated();
            let unrequested = was_authenticated && !state.signing_out;
            if state.session.is_some() {
                clear_session(state, effects);
            } else {
                forget_cached_profile(state, effects);
                state.phase = Phase::Unauthenticated;
                state.is_initializing = false;
                state.confirmed = true;
                state.generation += 1;
            }
            if unrequested {
                effects.push(Effect::Notify(Notice::SessionInvalid));
            }
        }
        (kind, None) => {
            warn!(event = %kind, "auth event without a session, ignoring");
        }
    }
}

fn on_tick(state: &mut SessionState, now: u64, policy: &Policy, effects: &mut Vec<Effect>) {
    let Some(session) = state.session.as_ref().filter(|_| state.is_authenticated()) else {
        if !state.confirmed && !state.is_initializing && state.phase != Phase::Uninitialized {
            effects.push(Effect::Reconcile {
                trigger: ReconcileTrigger::Tick,
                generation: state.generation,
            });
        }
        return;
    };

    let expires_at = session.expires_at;
    if policy.refresh.is_expired(expires_at, now) {
        effects.push(Effect::Reconcile {
            trigger: ReconcileTrigger::Expired,
            generation: state.generation,
        });
        return;
    }

    if let Some(fp) = state.fingerprint.clone() {
        effects.push(Effect::CheckOtherSessions(fp));
    }
    if policy.refresh.is_due(expires_at, now) && state.phase != Phase::Refreshing {
        effects.push(Effect::Refresh);
    }
    if policy.refresh.should_warn(expires_at, now) && !state.expiring_soon {
        state.expiring_soon = true;
        effects.push(Effect::Notify(Notice::ExpiringSoon { expires_at }));
    }
    if !state.confirmed {
        effects.push(Effect::Reconcile {
            trigger: ReconcileTrigger::Tick,
            generation: state.generation,
        });
    }
}

/// Apply the adapter's answer to a session pull.
fn apply_pulled(
    state: &mut SessionState,
    trigger: ReconcileTrigger,
    result: Result<Option<Session>, AdapterError>,
    policy: &Policy,
    effects: &mut Vec<Effect>,
) {
    match result {
        Ok(Some(session)) => {
            state.unreachable_streak = 0;
            if same_token(state, &session) {
                state.confirmed = true;
                state.is_initializing = false;
                if state.phase == Phase::Initializing {
                    state.phase = Phase::Authenticated;
                }
                return;
            }
            // An expired session comes back rotated by this tab's own adapter.
            let changed_elsewhere =
                !matches!(trigger, ReconcileTrigger::Initial | ReconcileTrigger::Expired)
                    && (state.is_authenticated() || state.confirmed);
            let fp = Fingerprint::from_token(&session.access_token);
            adopt(state, session, trigger == ReconcileTrigger::Expired, effects);
            if changed_elsewhere {
                effects.push(Effect::Notify(Notice::SessionChangedElsewhere { fingerprint: fp }));
            }
        }
        Ok(None) => {
            state.unreachable_streak = 0;
            if state.is_authenticated() {
                info!(%trigger, "identity reports no session");
                clear_session(state, effects);
                let notice = if trigger == ReconcileTrigger::Expired {
                    Notice::SessionInvalid
                } else {
                    Notice::SignedOutElsewhere
                };
                effects.push(Effect::Notify(notice));
            } else {
                state.phase = Phase::Unauthenticated;
                state.is_initializing = false;
                state.confirmed = true;
            }
        }
        Err(e) => {
            state.unreachable_streak += 1;
            warn!(%trigger, err = %e, failures = state.unreachable_streak, "session pull failed");
            if state.phase == Phase::Initializing {
                state.phase = Phase::Unauthenticated;
                state.is_initializing = false;
            }
            if state.unreachable_streak == policy.unreachable_notice_after {
                effects.push(Effect::Notify(Notice::IdentityUnreachable {
                    failures: state.unreachable_streak,
                }));
            }
        }
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
