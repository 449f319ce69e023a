// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Boundary to the hosted identity service.
//!
//! Everything the session machine knows about who is signed in comes through
//! [`IdentityService`]. Implementations keep their raw token in the shared
//! key-value store so every tab of the same origin sees the same session.

pub mod http;
pub mod token_store;

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::AdapterError;
use crate::profile::Profile;

pub use http::HttpIdentity;
pub use token_store::{StoredSession, TokenStore};

/// Boxed future returned by [`IdentityService`] methods.
pub type IdentityFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, AdapterError>> + Send + 'a>>;

/// Capacity of the auth event channel exposed by adapters.
pub const AUTH_EVENT_CAPACITY: usize = 64;

/// Identity claims carried alongside the token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityClaims {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// A signed-in session as reported by the identity service.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    pub access_token: String,
    pub refresh_token: String,
    /// Epoch milliseconds.
    pub expires_at: u64,
    #[serde(default)]
    pub claims: IdentityClaims,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("claims", &self.claims)
            .finish()
    }
}

/// Email/password pair for sign-in.
#[derive(Clone, Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Which sessions a sign-out revokes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignOutScope {
    /// Only this device's refresh token.
    Local,
    /// Every refresh token issued to the user.
    #[default]
    Global,
}

impl SignOutScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Global => "global",
        }
    }
}

impl fmt::Display for SignOutScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SignOutScope {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "global" => Ok(Self::Global),
            other => anyhow::bail!("invalid sign-out scope: {other}"),
        }
    }
}

/// Kind of an identity event pushed by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthEventKind {
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
}

impl AuthEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SignedIn => "SIGNED_IN",
            Self::SignedOut => "SIGNED_OUT",
            Self::TokenRefreshed => "TOKEN_REFRESHED",
            Self::UserUpdated => "USER_UPDATED",
        }
    }
}

impl fmt::Display for AuthEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An identity event together with the session it produced, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthEvent {
    pub kind: AuthEventKind,
    pub session: Option<Session>,
}

impl AuthEvent {
    pub fn new(kind: AuthEventKind, session: Option<Session>) -> Self {
        Self { kind, session }
    }
}

/// The hosted identity service as seen from one tab.
///
/// Events are delivered in the order the adapter emits them. Dropping the
/// receiver returned by [`subscribe`](Self::subscribe) unsubscribes.
pub trait IdentityService: Send + Sync + 'static {
    /// Current session, or `None` when nobody is signed in.
    fn get_session(&self) -> IdentityFuture<'_, Option<Session>>;

    /// Exchange the stored refresh token for a new session.
    fn refresh_session(&self) -> IdentityFuture<'_, Option<Session>>;

    fn sign_in_with_password<'a>(&'a self, credentials: &'a Credentials)
        -> IdentityFuture<'a, Session>;

    /// Revoke according to `scope`. The local token is always dropped.
    fn sign_out(&self, scope: SignOutScope) -> IdentityFuture<'_, ()>;

    fn get_profile<'a>(&'a self, user_id: &'a str) -> IdentityFuture<'a, Option<Profile>>;

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent>;

    /// Key under which this adapter keeps its raw token in the shared store.
    fn storage_key(&self) -> Option<String>;
}
