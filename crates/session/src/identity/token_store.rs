// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use bazaar_store::PersistentKv;
use serde::{Deserialize, Serialize};

use super::{IdentityClaims, Session};

/// Default key under which the identity adapter keeps its token.
pub const DEFAULT_TOKEN_KEY: &str = "auth.token";

/// User metadata block as the identity service stores it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredUser {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub user_metadata: UserMetadata,
}

impl StoredUser {
    pub fn claims(&self) -> IdentityClaims {
        IdentityClaims {
            email: self.email.clone(),
            name: self.user_metadata.full_name.clone().or_else(|| self.user_metadata.name.clone()),
            avatar_url: self.user_metadata.avatar_url.clone(),
        }
    }
}

/// Raw token record, kept as plain JSON (not an expiring envelope).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSession {
    pub access_token: String,
    pub refresh_token: String,
    /// Epoch milliseconds.
    pub expires_at: u64,
    pub user: StoredUser,
}

impl std::fmt::Debug for StoredSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredSession")
            .field("expires_at", &self.expires_at)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl From<StoredSession> for Session {
    fn from(stored: StoredSession) -> Self {
        let claims = stored.user.claims();
        Session {
            user_id: stored.user.id,
            access_token: stored.access_token,
            refresh_token: stored.refresh_token,
            expires_at: stored.expires_at,
            claims,
        }
    }
}

impl From<&Session> for StoredSession {
    fn from(session: &Session) -> Self {
        StoredSession {
            access_token: session.access_token.clone(),
            refresh_token: session.refresh_token.clone(),
            expires_at: session.expires_at,
            user: StoredUser {
                id: session.user_id.clone(),
                email: session.claims.email.clone(),
                user_metadata: UserMetadata {
                    full_name: session.claims.name.clone(),
                    name: None,
                    avatar_url: session.claims.avatar_url.clone(),
                },
            },
        }
    }
}

/// The adapter's token slot in the shared key-value store.
///
/// Every tab sharing a store sees the same slot, which is what makes a
/// sign-in or refresh in one tab visible to the others.
#[derive(Clone)]
pub struct TokenStore {
    kv: Arc<dyn PersistentKv>,
    key: String,
}

impl TokenStore {
    pub fn new(kv: Arc<dyn PersistentKv>, key: impl Into<String>) -> Self {
        Self { kv, key: key.into() }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Read the stored session. A record that does not parse is removed.
    pub fn load(&self) -> Option<Session> {
        let raw = self.kv.get(&self.key)?;
        match serde_json::from_str::<StoredSession>(&raw) {
            Ok(stored) => Some(stored.into()),
            Err(e) => {
                tracing::warn!(key = %self.key, err = %e, "discarding unreadable token record");
                self.kv.remove(&self.key);
                None
            }
        }
    }

    pub fn save(&self, session: &Session) {
        match serde_json::to_string(&StoredSession::from(session)) {
            Ok(json) => self.kv.set(&self.key, json),
            Err(e) => tracing::warn!(key = %self.key, err = %e, "failed to encode token record"),
        }
    }

    pub fn clear(&self) {
        self.kv.remove(&self.key);
    }
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore").field("key", &self.key).finish()
    }
}

#[cfg(test)]
#[path = "token_store_tests.rs"]
mod tests;
