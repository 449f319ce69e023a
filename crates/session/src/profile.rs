// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! User-visible profile and its optimistic cache.

use std::time::Duration;

use bazaar_store::ExpiringStorage;
use serde::{Deserialize, Serialize};

use crate::identity::IdentityClaims;

/// Key of the cached profile in the shared store.
pub const PROFILE_CACHE_KEY: &str = "session.profileCache";

/// Display name used when neither the store nor the claims provide one.
pub const FALLBACK_DISPLAY_NAME: &str = "user";

/// Profile row as stored by the relational backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

/// Whatever can be derived from identity claims alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialProfile {
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub email: Option<String>,
}

impl PartialProfile {
    pub fn from_claims(claims: &IdentityClaims) -> Self {
        Self {
            display_name: claims.name.clone(),
            avatar_url: claims.avatar_url.clone(),
            email: claims.email.clone(),
        }
    }
}

/// Where a profile came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileSource {
    FromStore(Profile),
    FromClaims(PartialProfile),
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.map(|s| s.trim()).filter(|s| !s.is_empty()).map(str::to_owned)
}

fn email_local_part(email: Option<&String>) -> Option<String> {
    let email = non_empty(email)?;
    let local = email.split('@').next().unwrap_or_default();
    (!local.is_empty()).then(|| local.to_owned())
}

/// Combine a profile source with identity claims.
///
/// Stored fields win; gaps are filled from the claims. A display name is
/// always present: claims name, then the email's local part, then
/// [`FALLBACK_DISPLAY_NAME`].
pub fn merge(user_id: &str, source: ProfileSource, claims: &IdentityClaims) -> Profile {
    let mut profile = match source {
        ProfileSource::FromStore(row) => row,
        ProfileSource::FromClaims(partial) => Profile {
            id: user_id.to_owned(),
            display_name: partial.display_name,
            username: None,
            avatar_url: partial.avatar_url,
            email: partial.email,
        },
    };
    if profile.id.is_empty() {
        profile.id = user_id.to_owned();
    }

    profile.email = non_empty(profile.email.as_ref()).or_else(|| non_empty(claims.email.as_ref()));
    profile.avatar_url =
        non_empty(profile.avatar_url.as_ref()).or_else(|| non_empty(claims.avatar_url.as_ref()));
    let display_name = non_empty(profile.display_name.as_ref())
        .or_else(|| non_empty(claims.name.as_ref()))
        .or_else(|| email_local_part(profile.email.as_ref()))
        .unwrap_or_else(|| FALLBACK_DISPLAY_NAME.to_owned());
    profile.display_name = Some(display_name);
    profile
}

/// Non-authoritative profile copy for instant rendering.
///
/// Never consulted for authorization; only surfaced as a hint while the
/// real profile is being fetched.
#[derive(Clone)]
pub struct ProfileCache {
    storage: ExpiringStorage,
    ttl: Duration,
}

impl ProfileCache {
    pub fn new(storage: ExpiringStorage, ttl: Duration) -> Self {
        Self { storage, ttl }
    }

    pub fn load(&self) -> Option<Profile> {
        self.storage.get(PROFILE_CACHE_KEY)
    }

    pub fn store(&self, profile: &Profile) {
        self.storage.set(PROFILE_CACHE_KEY, profile, Some(self.ttl));
    }

    pub fn clear(&self) {
        self.storage.remove(PROFILE_CACHE_KEY);
    }
}

#[cfg(test)]
#[path = "profile_tests.rs"]
mod tests;
