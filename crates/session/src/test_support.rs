// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-process identity fakes for tests.
//!
//! [`FakeIdentityBackend`] plays the hosted service shared by every tab.
//! [`FakeIdentity`] is one tab's adapter: like [`HttpIdentity`] it keeps the
//! current token in the shared key-value store, so tabs built on contexts of
//! the same store observe each other's sign-ins, refreshes and sign-outs.
//!
//! [`HttpIdentity`]: crate::identity::HttpIdentity

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bazaar_store::{Clock, PersistentKv};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};

use crate::error::AdapterError;
use crate::identity::token_store::DEFAULT_TOKEN_KEY;
use crate::identity::{
    AuthEvent, AuthEventKind, Credentials, IdentityClaims, IdentityFuture, IdentityService,
    Session, SignOutScope, TokenStore, AUTH_EVENT_CAPACITY,
};
use crate::profile::Profile;

struct Account {
    password: String,
    user_id: String,
    claims: IdentityClaims,
}

struct BackendState {
    accounts: HashMap<String, Account>,
    /// Live refresh tokens and the user each belongs to.
    refresh_tokens: HashMap<String, String>,
    profiles: HashMap<String, Profile>,
    token_seq: u64,
    token_ttl: Duration,
    refresh_error: Option<AdapterError>,
    sign_out_error: Option<AdapterError>,
    profile_error: Option<AdapterError>,
    unreachable: bool,
}

/// Shared fake of the hosted identity service.
#[derive(Clone)]
pub struct FakeIdentityBackend {
    state: Arc<Mutex<BackendState>>,
    clock: Arc<dyn Clock>,
}

impl FakeIdentityBackend {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(BackendState {
                accounts: HashMap::new(),
                refresh_tokens: HashMap::new(),
                profiles: HashMap::new(),
                token_seq: 0,
                token_ttl: Duration::from_secs(3600),
                refresh_error: None,
                sign_out_error: None,
                profile_error: None,
                unreachable: false,
            })),
            clock,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn add_user(&self, email: &str, password: &str, user_id: &str, name: Option<&str>) {
        self.state.lock().accounts.insert(
            email.to_owned(),
            Account {
                password: password.to_owned(),
                user_id: user_id.to_owned(),
                claims: IdentityClaims {
                    email: Some(email.to_owned()),
                    name: name.map(str::to_owned),
                    avatar_url: None,
                },
            },
        );
    }

    pub fn set_profile(&self, profile: Profile) {
        self.state.lock().profiles.insert(profile.id.clone(), profile);
    }

    /// Lifetime of tokens issued from now on.
    pub fn set_token_ttl(&self, ttl: Duration) {
        self.state.lock().token_ttl = ttl;
    }

    pub fn set_refresh_error(&self, err: Option<AdapterError>) {
        self.state.lock().refresh_error = err;
    }

    pub fn set_sign_out_error(&self, err: Option<AdapterError>) {
        self.state.lock().sign_out_error = err;
    }

    pub fn set_profile_error(&self, err: Option<AdapterError>) {
        self.state.lock().profile_error = err;
    }

    /// Make every call fail with [`AdapterError::Unreachable`].
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    /// Revoke every refresh token of `user_id`, as a global sign-out from
    /// another device would.
    pub fn revoke_user(&self, user_id: &str) {
        self.state.lock().refresh_tokens.retain(|_, owner| owner != user_id);
    }

    fn check_reachable(state: &BackendState) -> Result<(), AdapterError> {
        if state.unreachable {
            return Err(AdapterError::Unreachable("fake backend offline".into()));
        }
        Ok(())
    }

    fn issue(&self, state: &mut BackendState, user_id: &str, claims: IdentityClaims) -> Session {
        state.token_seq += 1;
        let seq = state.token_seq;
        let refresh_token = format!("fake-refresh-{seq:08}");
        state.refresh_tokens.insert(refresh_token.clone(), user_id.to_owned());
        let ttl_ms = state.token_ttl.as_millis() as u64;
        Session {
            user_id: user_id.to_owned(),
            access_token: format!("fake-access-{seq:08}"),
            refresh_token,
            expires_at: self.clock.now_ms().saturating_add(ttl_ms),
            claims,
        }
    }

    fn sign_in(&self, credentials: &Credentials) -> Result<Session, AdapterError> {
        let mut state = self.state.lock();
        Self::check_reachable(&state)?;
        let (user_id, claims) = match state.accounts.get(&credentials.email) {
            Some(account) if account.password == credentials.password => {
                (account.user_id.clone(), account.claims.clone())
            }
            _ => return Err(AdapterError::InvalidCredentials),
        };
        Ok(self.issue(&mut state, &user_id, claims))
    }

    fn refresh(&self, current: &Session) -> Result<Session, AdapterError> {
        let mut state = self.state.lock();
        Self::check_reachable(&state)?;
        if let Some(err) = state.refresh_error.clone() {
            return Err(err);
        }
        if state.refresh_tokens.remove(&current.refresh_token).is_none() {
            return Err(AdapterError::InvalidGrant("refresh token not found".into()));
        }
        Ok(self.issue(&mut state, &current.user_id, current.claims.clone()))
    }

    fn sign_out(&self, session: &Session, scope: SignOutScope) -> Result<(), AdapterError> {
        let mut state = self.state.lock();
        Self::check_reachable(&state)?;
        if let Some(err) = state.sign_out_error.clone() {
            return Err(err);
        }
        match scope {
            SignOutScope::Local => {
                state.refresh_tokens.remove(&session.refresh_token);
            }
            SignOutScope::Global => {
                state.refresh_tokens.retain(|_, owner| owner != &session.user_id);
            }
        }
        Ok(())
    }

    fn profile(&self, user_id: &str) -> Result<Option<Profile>, AdapterError> {
        let state = self.state.lock();
        Self::check_reachable(&state)?;
        if let Some(err) = state.profile_error.clone() {
            return Err(err);
        }
        Ok(state.profiles.get(user_id).cloned())
    }

    fn reachable(&self) -> Result<(), AdapterError> {
        Self::check_reachable(&self.state.lock())
    }
}

/// Per-method call counts of one [`FakeIdentity`].
#[derive(Debug, Default)]
pub struct CallCounts {
    pub get_session: AtomicU32,
    pub refresh_session: AtomicU32,
    pub sign_in: AtomicU32,
    pub sign_out: AtomicU32,
    pub get_profile: AtomicU32,
}

impl CallCounts {
    pub fn get_session(&self) -> u32 {
        self.get_session.load(Ordering::SeqCst)
    }

    pub fn refresh_session(&self) -> u32 {
        self.refresh_session.load(Ordering::SeqCst)
    }

    pub fn sign_in(&self) -> u32 {
        self.sign_in.load(Ordering::SeqCst)
    }

    pub fn sign_out(&self) -> u32 {
        self.sign_out.load(Ordering::SeqCst)
    }

    pub fn get_profile(&self) -> u32 {
        self.get_profile.load(Ordering::SeqCst)
    }
}

/// One tab's adapter over a [`FakeIdentityBackend`].
pub struct FakeIdentity {
    backend: FakeIdentityBackend,
    tokens: TokenStore,
    events: broadcast::Sender<AuthEvent>,
    gate: watch::Sender<bool>,
    calls: Arc<CallCounts>,
}

impl FakeIdentity {
    pub fn new(backend: FakeIdentityBackend, kv: Arc<dyn PersistentKv>) -> Self {
        Self::with_token_key(backend, kv, DEFAULT_TOKEN_KEY)
    }

    /// Keep the token under `token_key`, so tabs can hold separate sessions
    /// while still sharing markers and the profile cache.
    pub fn with_token_key(
        backend: FakeIdentityBackend,
        kv: Arc<dyn PersistentKv>,
        token_key: &str,
    ) -> Self {
        let (events, _) = broadcast::channel(AUTH_EVENT_CAPACITY);
        let (gate, _) = watch::channel(true);
        Self {
            backend,
            tokens: TokenStore::new(kv, token_key),
            events,
            gate,
            calls: Arc::new(CallCounts::default()),
        }
    }

    pub fn calls(&self) -> Arc<CallCounts> {
        Arc::clone(&self.calls)
    }

    /// Make `get_session` wait until [`release_get_session`] is called.
    ///
    /// [`release_get_session`]: Self::release_get_session
    pub fn hold_get_session(&self) {
        self.gate.send_replace(false);
    }

    pub fn release_get_session(&self) {
        self.gate.send_replace(true);
    }

    /// Push an event as if the service emitted it.
    pub fn emit(&self, kind: AuthEventKind, session: Option<Session>) {
        let _ = self.events.send(AuthEvent::new(kind, session));
    }

    async fn wait_for_gate(&self) {
        let mut rx = self.gate.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }

    fn refresh_stored(&self, current: &Session) -> Result<Option<Session>, AdapterError> {
        match self.backend.refresh(current) {
            Ok(session) => {
                self.tokens.save(&session);
                self.emit(AuthEventKind::TokenRefreshed, Some(session.clone()));
                Ok(Some(session))
            }
            Err(AdapterError::InvalidGrant(msg)) => {
                self.tokens.clear();
                self.emit(AuthEventKind::SignedOut, None);
                Err(AdapterError::InvalidGrant(msg))
            }
            Err(e) => Err(e),
        }
    }
}

impl IdentityService for FakeIdentity {
    fn get_session(&self) -> IdentityFuture<'_, Option<Session>> {
        Box::pin(async move {
            self.calls.get_session.fetch_add(1, Ordering::SeqCst);
            self.wait_for_gate().await;
            self.backend.reachable()?;
            let Some(session) = self.tokens.load() else {
                return Ok(None);
            };
            if session.expires_at > self.backend.clock.now_ms() {
                return Ok(Some(session));
            }
            match self.refresh_stored(&session) {
                Err(AdapterError::InvalidGrant(_)) => Ok(None),
                other => other,
            }
        })
    }

    fn refresh_session(&self) -> IdentityFuture<'_, Option<Session>> {
        Box::pin(async move {
            self.calls.refresh_session.fetch_add(1, Ordering::SeqCst);
            let Some(session) = self.tokens.load() else {
                return Ok(None);
            };
            self.refresh_stored(&session)
        })
    }

    fn sign_in_with_password<'a>(
        &'a self,
        credentials: &'a Credentials,
    ) -> IdentityFuture<'a, Session> {
        Box::pin(async move {
            self.calls.sign_in.fetch_add(1, Ordering::SeqCst);
            let session = self.backend.sign_in(credentials)?;
            self.tokens.save(&session);
            self.emit(AuthEventKind::SignedIn, Some(session.clone()));
            Ok(session)
        })
    }

    fn sign_out(&self, scope: SignOutScope) -> IdentityFuture<'_, ()> {
        Box::pin(async move {
            self.calls.sign_out.fetch_add(1, Ordering::SeqCst);
            let stored = self.tokens.load();
            self.tokens.clear();
            self.emit(AuthEventKind::SignedOut, None);
            match stored {
                Some(session) => self.backend.sign_out(&session, scope),
                None => Ok(()),
            }
        })
    }

    fn get_profile<'a>(&'a self, user_id: &'a str) -> IdentityFuture<'a, Option<Profile>> {
        Box::pin(async move {
            self.calls.get_profile.fetch_add(1, Ordering::SeqCst);
            self.backend.profile(user_id)
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    fn storage_key(&self) -> Option<String> {
        Some(self.tokens.key().to_owned())
    }
}

/// Adapter whose `get_session` answer is set by the test, independent of
/// anything written to the store.
pub struct ScriptedIdentity {
    answer: Mutex<Result<Option<Session>, AdapterError>>,
    events: broadcast::Sender<AuthEvent>,
    calls: Arc<CallCounts>,
    storage_key: String,
}

impl ScriptedIdentity {
    pub fn new(answer: Option<Session>) -> Self {
        let (events, _) = broadcast::channel(AUTH_EVENT_CAPACITY);
        Self {
            answer: Mutex::new(Ok(answer)),
            events,
            calls: Arc::new(CallCounts::default()),
            storage_key: DEFAULT_TOKEN_KEY.to_owned(),
        }
    }

    pub fn set_answer(&self, answer: Result<Option<Session>, AdapterError>) {
        *self.answer.lock() = answer;
    }

    pub fn calls(&self) -> Arc<CallCounts> {
        Arc::clone(&self.calls)
    }
}

impl IdentityService for ScriptedIdentity {
    fn get_session(&self) -> IdentityFuture<'_, Option<Session>> {
        Box::pin(async move {
            self.calls.get_session.fetch_add(1, Ordering::SeqCst);
            self.answer.lock().clone()
        })
    }

    fn refresh_session(&self) -> IdentityFuture<'_, Option<Session>> {
        Box::pin(async move {
            self.calls.refresh_session.fetch_add(1, Ordering::SeqCst);
            self.answer.lock().clone()
        })
    }

    fn sign_in_with_password<'a>(
        &'a self,
        _credentials: &'a Credentials,
    ) -> IdentityFuture<'a, Session> {
        Box::pin(async move {
            self.calls.sign_in.fetch_add(1, Ordering::SeqCst);
            Err(AdapterError::InvalidCredentials)
        })
    }

    fn sign_out(&self, _scope: SignOutScope) -> IdentityFuture<'_, ()> {
        Box::pin(async move {
            self.calls.sign_out.fetch_add(1, Ordering::SeqCst);
            *self.answer.lock() = Ok(None);
            let _ = self.events.send(AuthEvent::new(AuthEventKind::SignedOut, None));
            Ok(())
        })
    }

    fn get_profile<'a>(&'a self, _user_id: &'a str) -> IdentityFuture<'a, Option<Profile>> {
        Box::pin(async move {
            self.calls.get_profile.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    fn storage_key(&self) -> Option<String> {
        Some(self.storage_key.clone())
    }
}
