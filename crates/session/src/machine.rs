// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Runtime for one tab's session.
//!
//! A single driver task owns [`SessionState`] and feeds inputs through
//! [`reduce`] strictly in arrival order. Adapter calls never run on the
//! driver: each one is spawned and posts its result back as an input, so new
//! identity events keep flowing while a call is outstanding.

use std::sync::Arc;
use std::time::Duration;

use bazaar_store::ExpiringStorage;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::config::SessionSettings;
use crate::error::AdapterError;
use crate::events::{Notice, NoticeHub};
use crate::fingerprint::Fingerprint;
use crate::identity::{AuthEvent, AuthEventKind, Credentials, IdentityService, Session, SignOutScope};
use crate::markers::MultiSessionDetector;
use crate::profile::{PartialProfile, ProfileCache, ProfileSource};
use crate::scheduler::{spawn_ticker, RefreshOutcome, RefreshPolicy, TokenRefreshScheduler};
use crate::state::{
    reduce, Effect, Input, Phase, Policy, ReconcileTrigger, SessionSnapshot, SessionState,
};

/// Collaborators a tab is built from.
#[derive(Clone)]
pub struct SessionDeps {
    pub identity: Arc<dyn IdentityService>,
    /// Expiring view of the shared store; also supplies the clock.
    pub storage: ExpiringStorage,
}

/// Parts shared between the driver, spawned calls and the public handle.
struct Shared {
    tab: String,
    identity: Arc<dyn IdentityService>,
    detector: MultiSessionDetector,
    profiles: ProfileCache,
    scheduler: TokenRefreshScheduler,
    settings: SessionSettings,
    input: mpsc::UnboundedSender<Input>,
    session: watch::Receiver<Option<Session>>,
    notices: NoticeHub,
}

impl Shared {
    fn post(&self, input: Input) {
        if self.input.send(input).is_err() {
            debug!(tab = %self.tab, "session driver gone, dropping input");
        }
    }

    async fn refresh(&self) -> RefreshOutcome {
        let session = self.session.borrow().clone();
        let outcome =
            self.scheduler.refresh_if_due(session.as_ref(), || self.post(Input::RefreshStarted)).await;
        if !matches!(outcome, RefreshOutcome::NotDue | RefreshOutcome::InFlight) {
            self.post(Input::RefreshFinished(outcome.clone()));
        }
        outcome
    }
}

/// Handle to a running tab session. Cheap to clone.
#[derive(Clone)]
pub struct SessionMachine {
    shared: Arc<Shared>,
    snapshot: watch::Receiver<SessionSnapshot>,
    shutdown: CancellationToken,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl SessionMachine {
    /// Start the session for one tab. Must be called inside a tokio runtime.
    ///
    /// The machine enters `Initializing` immediately and asks the adapter
    /// for the current session. If no answer arrives within
    /// `settings.init_timeout`, `is_initializing` drops to false anyway; a
    /// late answer is still applied unless a fresher event came first.
    pub fn start(deps: SessionDeps, settings: SessionSettings) -> Self {
        let tab: String = uuid::Uuid::new_v4().simple().to_string().chars().take(8).collect();
        let shutdown = CancellationToken::new();
        let clock = Arc::clone(deps.storage.clock());
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());
        let (session_tx, session_rx) = watch::channel(None);

        let refresh_policy = RefreshPolicy {
            refresh_window: settings.refresh_window,
            warn_window: settings.warn_window,
        };
        let shared = Arc::new(Shared {
            tab: tab.clone(),
            identity: Arc::clone(&deps.identity),
            detector: MultiSessionDetector::new(deps.storage.clone(), settings.marker_ttl),
            profiles: ProfileCache::new(deps.storage.clone(), settings.profile_cache_ttl),
            scheduler: TokenRefreshScheduler::new(
                Arc::clone(&deps.identity),
                Arc::clone(&clock),
                refresh_policy,
                settings.adapter_timeout,
            ),
            settings: settings.clone(),
            input: input_tx.clone(),
            session: session_rx,
            notices: NoticeHub::new(),
        });

        let span = tracing::info_span!("tab", id = %tab);
        let mut tasks = Vec::new();

        // Subscribe before the first pull so no event can slip between them.
        let auth_rx = deps.identity.subscribe();
        tasks.push(tokio::spawn(
            forward_auth_events(auth_rx, input_tx.clone(), shutdown.clone()).instrument(span.clone()),
        ));

        let policy = Policy {
            refresh: refresh_policy,
            unreachable_notice_after: settings.unreachable_notice_after,
        };
        let driver = Driver {
            shared: Arc::clone(&shared),
            state: SessionState::default(),
            policy,
            snapshot: snapshot_tx,
            session: session_tx,
        };
        tasks.push(tokio::spawn(driver.run(input_rx, shutdown.clone()).instrument(span.clone())));

        let timeout_tx = input_tx.clone();
        let timeout_shutdown = shutdown.clone();
        let init_timeout = settings.init_timeout;
        tasks.push(tokio::spawn(async move {
            tokio::select! {
                _ = timeout_shutdown.cancelled() => {}
                _ = tokio::time::sleep(init_timeout) => {
                    let _ = timeout_tx.send(Input::InitTimeout);
                }
            }
        }));

        tasks.push(spawn_ticker(input_tx, settings.tick_interval, clock, shutdown.clone()));

        shared.post(Input::Start { cached_profile: shared.profiles.load() });
        info!(tab = %tab, "session started");

        Self { shared, snapshot: snapshot_rx, shutdown, tasks: Arc::new(Mutex::new(tasks)) }
    }

    /// Short identifier of this tab, used in logs.
    pub fn tab(&self) -> &str {
        &self.shared.tab
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.shared.settings
    }

    pub fn identity(&self) -> &Arc<dyn IdentityService> {
        &self.shared.identity
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Observe every state change.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Wait until the snapshot satisfies `pred` and return it.
    pub async fn wait_for(&self, pred: impl FnMut(&SessionSnapshot) -> bool) -> SessionSnapshot {
        let mut rx = self.snapshot.clone();
        let result = rx.wait_for(pred).await.map(|snap| snap.clone());
        result.unwrap_or_else(|_| self.snapshot())
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.shared.notices.subscribe()
    }

    /// Sign in with email and password. Returns whether sign-in succeeded;
    /// on success the snapshot already reflects the new session.
    pub async fn login(&self, email: &str, password: &str) -> bool {
        let credentials = Credentials { email: email.to_owned(), password: password.to_owned() };
        let timeout = self.shared.settings.adapter_timeout;
        let result =
            tokio::time::timeout(timeout, self.shared.identity.sign_in_with_password(&credentials))
                .await
                .unwrap_or(Err(AdapterError::Timeout));

        let session = match result {
            Ok(session) => session,
            Err(e) => {
                warn!(tab = %self.shared.tab, err = %e, "sign-in failed");
                return false;
            }
        };

        let fp = Fingerprint::from_token(&session.access_token);
        self.shared.post(Input::Auth(AuthEvent::new(AuthEventKind::SignedIn, Some(session))));
        let applied = tokio::time::timeout(
            timeout,
            self.wait_for(|s| s.is_authenticated && s.fingerprint.as_ref() == Some(&fp)),
        )
        .await;
        if applied.is_err() {
            debug!(tab = %self.shared.tab, "sign-in accepted but superseded before it was applied");
        }
        true
    }

    /// Sign out with the configured default scope.
    pub async fn logout(&self) {
        self.logout_with_scope(self.shared.settings.sign_out_scope).await;
    }

    /// Sign out. Never fails: if the remote call errors the user is told,
    /// and local state is cleared regardless.
    pub async fn logout_with_scope(&self, scope: SignOutScope) {
        self.shared.post(Input::SignOutRequested);
        let timeout = self.shared.settings.adapter_timeout;
        let result = tokio::time::timeout(timeout, self.shared.identity.sign_out(scope))
            .await
            .unwrap_or(Err(AdapterError::Timeout));
        if let Err(e) = result {
            warn!(tab = %self.shared.tab, %scope, err = %e, "remote sign-out failed");
            self.shared.notices.publish(Notice::LogoutFailed { message: e.to_string() });
        }
        self.shared.post(Input::LocalSignOut);
        let _ = tokio::time::timeout(timeout, self.wait_for(|s| s.phase == Phase::Unauthenticated))
            .await;
    }

    /// Refresh now if the token is inside the refresh window; otherwise a
    /// no-op that never reaches the adapter.
    pub async fn refresh_session(&self) -> RefreshOutcome {
        self.shared.refresh().await
    }

    /// Ask the adapter for the current session and reconcile with it.
    pub fn reconcile(&self, trigger: ReconcileTrigger) {
        self.shared.post(Input::ReconcileRequested(trigger));
    }

    /// Stop all tasks and remove this tab's markers.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        self.shared.detector.remove_all_own();
        info!(tab = %self.shared.tab, "session closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

async fn forward_auth_events(
    mut rx: broadcast::Receiver<AuthEvent>,
    input: mpsc::UnboundedSender<Input>,
    shutdown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = rx.recv() => next,
        };
        let sent = match next {
            Ok(event) => input.send(Input::Auth(event)),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "auth events lagged, re-reading session");
                input.send(Input::ReconcileRequested(ReconcileTrigger::Manual))
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if sent.is_err() {
            break;
        }
    }
}

struct Driver {
    shared: Arc<Shared>,
    state: SessionState,
    policy: Policy,
    snapshot: watch::Sender<SessionSnapshot>,
    session: watch::Sender<Option<Session>>,
}

impl Driver {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Input>, shutdown: CancellationToken) {
        loop {
            let input = tokio::select! {
                _ = shutdown.cancelled() => break,
                input = rx.recv() => input,
            };
            let Some(input) = input else { break };
            self.apply(input);
        }
        debug!("session driver stopped");
    }

    fn apply(&mut self, input: Input) {
        let state = std::mem::take(&mut self.state);
        let transition = reduce(state, input, &self.policy);
        self.state = transition.state;

        // Side effects land before the snapshot that announces them.
        for effect in transition.effects {
            self.execute(effect);
        }

        let snapshot = self.state.snapshot();
        self.snapshot.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
        let session = self.state.session.clone();
        self.session.send_if_modified(|current| {
            if *current == session {
                return false;
            }
            *current = session;
            true
        });
    }

    fn execute(&self, effect: Effect) {
        let shared = &self.shared;
        match effect {
            Effect::FetchProfile { user_id, claims } => {
                let shared = Arc::clone(shared);
                tokio::spawn(
                    async move {
                        let timeout = shared.settings.adapter_timeout;
                        let fetched =
                            tokio::time::timeout(timeout, shared.identity.get_profile(&user_id))
                                .await
                                .unwrap_or(Err(AdapterError::Timeout));
                        let source = match fetched {
                            Ok(Some(profile)) => ProfileSource::FromStore(profile),
                            Ok(None) => ProfileSource::FromClaims(PartialProfile::from_claims(&claims)),
                            Err(e) => {
                                warn!(user = %user_id, err = %e, "profile fetch failed, using identity claims");
                                ProfileSource::FromClaims(PartialProfile::from_claims(&claims))
                            }
                        };
                        shared.post(Input::ProfileLoaded { user_id, source });
                    }
                    .in_current_span(),
                );
            }
            Effect::WriteProfileCache(profile) => shared.profiles.store(&profile),
            Effect::ClearProfileCache => shared.profiles.clear(),
            Effect::RegisterMarker(fp) => shared.detector.register(&fp),
            Effect::RemoveMarker(fp) => {
                shared.detector.remove_own(&fp);
            }
            Effect::CheckOtherSessions(fp) => {
                let present = shared.detector.check_for_other_sessions(&fp);
                shared.post(Input::OtherSessions { fingerprint: fp, present });
            }
            Effect::Refresh => {
                let shared = Arc::clone(shared);
                tokio::spawn(
                    async move {
                        shared.refresh().await;
                    }
                    .in_current_span(),
                );
            }
            Effect::Reconcile { trigger, generation } => {
                let shared = Arc::clone(shared);
                tokio::spawn(
                    async move {
                        debug!(%trigger, generation, "pulling session");
                        let result = if trigger == ReconcileTrigger::Initial {
                            // Bounded by the init timeout instead; the call
                            // itself is never cut short.
                            shared.identity.get_session().await
                        } else {
                            let timeout = shared.settings.adapter_timeout;
                            tokio::time::timeout(timeout, shared.identity.get_session())
                                .await
                                .unwrap_or(Err(AdapterError::Timeout))
                        };
                        shared.post(Input::Reconciled { trigger, generation, result });
                    }
                    .in_current_span(),
                );
            }
            Effect::Notify(notice) => shared.notices.publish(notice),
        }
    }
}

/// Default init ceiling plus a little slack, for callers that wait on
/// initialization themselves.
pub fn init_wait_bound(settings: &SessionSettings) -> Duration {
    settings.init_timeout + Duration::from_millis(500)
}

#[cfg(test)]
#[path = "machine_tests.rs"]
mod tests;
