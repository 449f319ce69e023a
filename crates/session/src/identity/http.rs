// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Hosted identity client over HTTP.
//!
//! Speaks the GoTrue-style token endpoints and a PostgREST-style profile
//! table. The current token lives in the shared key-value store via
//! [`TokenStore`], so a refresh performed by one tab is what the next
//! `get_session` in every other tab returns.

use std::sync::{Arc, Once};
use std::time::Duration;

use bazaar_store::{Clock, PersistentKv};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::broadcast;

use super::token_store::StoredUser;
use super::{
    AuthEvent, AuthEventKind, Credentials, IdentityFuture, IdentityService, Session,
    SignOutScope, TokenStore, AUTH_EVENT_CAPACITY,
};
use crate::error::AdapterError;
use crate::profile::Profile;

static CRYPTO_INIT: Once = Once::new();

/// Install the ring crypto provider for reqwest/rustls.
/// Safe to call multiple times; only the first call has effect.
pub fn ensure_crypto() {
    CRYPTO_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Connection settings for [`HttpIdentity`].
#[derive(Debug, Clone)]
pub struct HttpIdentityConfig {
    pub base_url: String,
    pub api_key: String,
    pub token_key: String,
    pub timeout: Duration,
}

/// Token grant response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
    /// Epoch seconds.
    #[serde(default)]
    expires_at: Option<u64>,
    user: StoredUser,
}

/// Error body shapes used by the identity service (old and new style).
#[derive(Debug, Default, Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl ErrorPayload {
    fn parse(text: &str) -> Self {
        serde_json::from_str(text).unwrap_or_default()
    }

    fn code(&self) -> &str {
        self.error_code.as_deref().or(self.error.as_deref()).unwrap_or("")
    }

    fn describe(&self, fallback: &str) -> String {
        self.error_description
            .clone()
            .or_else(|| self.msg.clone())
            .or_else(|| self.message.clone())
            .unwrap_or_else(|| fallback.to_owned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Grant {
    Password,
    RefreshToken,
}

impl Grant {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Password => "password",
            Self::RefreshToken => "refresh_token",
        }
    }
}

/// Classify a failed token grant.
fn classify_grant_failure(grant: Grant, status: StatusCode, text: &str) -> AdapterError {
    let payload = ErrorPayload::parse(text);
    let code = payload.code();
    let message = payload.describe(text);
    let client_error = status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED;
    match grant {
        Grant::Password
            if client_error && matches!(code, "invalid_grant" | "invalid_credentials") =>
        {
            AdapterError::InvalidCredentials
        }
        Grant::RefreshToken
            if client_error
                && matches!(
                    code,
                    "invalid_grant" | "refresh_token_not_found" | "refresh_token_already_used"
                ) =>
        {
            AdapterError::InvalidGrant(message)
        }
        _ => AdapterError::Rejected { status: status.as_u16(), message },
    }
}

/// HTTP implementation of [`IdentityService`].
pub struct HttpIdentity {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    tokens: TokenStore,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<AuthEvent>,
    /// Serialises refreshes within this tab so a refresh token is spent once.
    refresh_lock: tokio::sync::Mutex<()>,
}

impl HttpIdentity {
    pub fn new(
        config: HttpIdentityConfig,
        kv: Arc<dyn PersistentKv>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        ensure_crypto();
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        let (events, _) = broadcast::channel(AUTH_EVENT_CAPACITY);
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            api_key: config.api_key,
            tokens: TokenStore::new(kv, config.token_key),
            clock,
            events,
            refresh_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn emit(&self, kind: AuthEventKind, session: Option<Session>) {
        tracing::debug!(event = %kind, "identity event");
        // No receivers is fine; nobody is listening yet.
        let _ = self.events.send(AuthEvent::new(kind, session));
    }

    async fn grant(&self, grant: Grant, body: serde_json::Value) -> Result<Session, AdapterError> {
        let url = format!("{}/auth/v1/token?grant_type={}", self.base_url, grant.as_str());
        let resp = self
            .client
            .post(&url)
            .header("apikey", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AdapterError::from_reqwest(&e))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_grant_failure(grant, status, &text));
        }

        let token: TokenResponse = resp.json().await.map_err(|e| AdapterError::from_reqwest(&e))?;
        Ok(self.session_from(token))
    }

    fn session_from(&self, token: TokenResponse) -> Session {
        let expires_at = match (token.expires_at, token.expires_in) {
            (Some(secs), _) => secs.saturating_mul(1000),
            (None, Some(secs)) => self.clock.now_ms().saturating_add(secs.saturating_mul(1000)),
            (None, None) => self.clock.now_ms(),
        };
        let claims = token.user.claims();
        Session {
            user_id: token.user.id,
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at,
            claims,
        }
    }

    /// Refresh using whatever token is currently stored.
    ///
    /// If another tab already rotated the stored token, the fresher record is
    /// used as-is rather than spending a refresh token twice.
    async fn refresh_stored(&self, seen: &Session) -> Result<Option<Session>, AdapterError> {
        let _guard = self.refresh_lock.lock().await;
        let Some(current) = self.tokens.load() else {
            return Ok(None);
        };
        if current.access_token != seen.access_token && current.expires_at > self.clock.now_ms() {
            return Ok(Some(current));
        }

        let body = serde_json::json!({ "refresh_token": current.refresh_token });
        match self.grant(Grant::RefreshToken, body).await {
            Ok(session) => {
                self.tokens.save(&session);
                tracing::info!(user = %session.user_id, "token refreshed");
                self.emit(AuthEventKind::TokenRefreshed, Some(session.clone()));
                Ok(Some(session))
            }
            Err(AdapterError::InvalidGrant(msg)) => {
                tracing::warn!(err = %msg, "refresh token rejected, dropping session");
                self.tokens.clear();
                self.emit(AuthEventKind::SignedOut, None);
                Err(AdapterError::InvalidGrant(msg))
            }
            Err(e) => Err(e),
        }
    }
}

impl IdentityService for HttpIdentity {
    fn get_session(&self) -> IdentityFuture<'_, Option<Session>> {
        Box::pin(async move {
            let Some(session) = self.tokens.load() else {
                return Ok(None);
            };
            if session.expires_at > self.clock.now_ms() {
                return Ok(Some(session));
            }
            match self.refresh_stored(&session).await {
                Err(AdapterError::InvalidGrant(_)) => Ok(None),
                other => other,
            }
        })
    }

    fn refresh_session(&self) -> IdentityFuture<'_, Option<Session>> {
        Box::pin(async move {
            let Some(session) = self.tokens.load() else {
                return Ok(None);
            };
            self.refresh_stored(&session).await
        })
    }

    fn sign_in_with_password<'a>(
        &'a self,
        credentials: &'a Credentials,
    ) -> IdentityFuture<'a, Session> {
        Box::pin(async move {
            let body = serde_json::json!({
                "email": credentials.email,
                "password": credentials.password,
            });
            let session = self.grant(Grant::Password, body).await?;
            self.tokens.save(&session);
            tracing::info!(user = %session.user_id, "signed in");
            self.emit(AuthEventKind::SignedIn, Some(session.clone()));
            Ok(session)
        })
    }

    fn sign_out(&self, scope: SignOutScope) -> IdentityFuture<'_, ()> {
        Box::pin(async move {
            let stored = self.tokens.load();
            self.tokens.clear();
            self.emit(AuthEventKind::SignedOut, None);

            let Some(session) = stored else {
                return Ok(());
            };
            let url = format!("{}/auth/v1/logout?scope={}", self.base_url, scope.as_str());
            let resp = self
                .client
                .post(&url)
                .header("apikey", &self.api_key)
                .bearer_auth(&session.access_token)
                .send()
                .await
                .map_err(|e| AdapterError::from_reqwest(&e))?;

            let status = resp.status();
            // An already-dead token is as signed out as it gets.
            if status.is_success() || status == StatusCode::UNAUTHORIZED {
                return Ok(());
            }
            let text = resp.text().await.unwrap_or_default();
            let message = ErrorPayload::parse(&text).describe(&text);
            Err(AdapterError::Rejected { status: status.as_u16(), message })
        })
    }

    fn get_profile<'a>(&'a self, user_id: &'a str) -> IdentityFuture<'a, Option<Profile>> {
        Box::pin(async move {
            let url = format!("{}/rest/v1/profiles?id=eq.{user_id}&select=*", self.base_url);
            let mut req = self.client.get(&url).header("apikey", &self.api_key);
            if let Some(session) = self.tokens.load() {
                req = req.bearer_auth(&session.access_token);
            }
            let resp = req.send().await.map_err(|e| AdapterError::from_reqwest(&e))?;

            let status = resp.status();
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                let message = ErrorPayload::parse(&text).describe(&text);
                return Err(AdapterError::Rejected { status: status.as_u16(), message });
            }
            let rows: Vec<Profile> =
                resp.json().await.map_err(|e| AdapterError::from_reqwest(&e))?;
            Ok(rows.into_iter().next())
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    fn storage_key(&self) -> Option<String> {
        Some(self.tokens.key().to_owned())
    }
}

#[cfg(test)]
#[path = "http_tests.rs"]
mod tests;
