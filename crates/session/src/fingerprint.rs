// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of trailing token characters kept.
pub const FINGERPRINT_LEN: usize = 8;

/// Short identifier for an access token, used only to tell tabs' sessions
/// apart. Not a security boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Last [`FINGERPRINT_LEN`] characters of `token`, or all of it if shorter.
    pub fn from_token(token: &str) -> Self {
        let count = token.chars().count();
        let tail: String = token.chars().skip(count.saturating_sub(FINGERPRINT_LEN)).collect();
        Self(tail)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
#[path = "fingerprint_tests.rs"]
mod tests;
