// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! User-visible session notices and the hub that fans them out.
//!
//! Notices are passive: the UI shows them without blocking. The single
//! exception is [`Notice::SessionInvalid`], which routes to sign-in.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::fingerprint::Fingerprint;

/// Capacity of the notice channel.
pub const NOTICE_CAPACITY: usize = 64;

// -- Notice types ------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notice {
    /// Another tab (or device) ended the session this tab was using.
    SignedOutElsewhere,
    /// Another tab refreshed or signed in; this tab adopted the new session.
    SessionChangedElsewhere { fingerprint: Fingerprint },
    /// A different live session was detected alongside this one.
    OtherSessionsActive,
    /// The token expires soon and could not be refreshed yet.
    ExpiringSoon { expires_at: u64 },
    /// A refresh attempt failed; the current token stays in use.
    RefreshFailed { message: String },
    /// The remote sign-out failed; local state was cleared anyway.
    LogoutFailed { message: String },
    /// The identity service has failed repeatedly.
    IdentityUnreachable { failures: u32 },
    /// The session is no longer valid; the user must sign in again.
    SessionInvalid,
}

impl Notice {
    /// Whether the notice must send the user to the sign-in flow.
    pub fn requires_sign_in(&self) -> bool {
        matches!(self, Self::SessionInvalid)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SignedOutElsewhere => "signed_out_elsewhere",
            Self::SessionChangedElsewhere { .. } => "session_changed_elsewhere",
            Self::OtherSessionsActive => "other_sessions_active",
            Self::ExpiringSoon { .. } => "expiring_soon",
            Self::RefreshFailed { .. } => "refresh_failed",
            Self::LogoutFailed { .. } => "logout_failed",
            Self::IdentityUnreachable { .. } => "identity_unreachable",
            Self::SessionInvalid => "session_invalid",
        }
    }
}

// -- Notice hub --------------------------------------------------------------

/// Fans notices out to any number of listeners.
#[derive(Debug, Clone)]
pub struct NoticeHub {
    tx: broadcast::Sender<Notice>,
}

impl NoticeHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTICE_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.tx.subscribe()
    }

    pub fn publish(&self, notice: Notice) {
        if notice.requires_sign_in() {
            tracing::warn!(notice = notice.as_str(), "session notice");
        } else {
            tracing::info!(notice = notice.as_str(), "session notice");
        }
        // Nobody listening is fine.
        let _ = self.tx.send(notice);
    }
}

impl Default for NoticeHub {
    fn default() -> Self {
        Self::new()
    }
}
