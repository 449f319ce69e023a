// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

use bazaar_store::ENVELOPE_NAMESPACE;
use clap::Parser;

use crate::identity::SignOutScope;

/// Default ceiling on how long the UI waits for the first session answer.
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(3);

/// Timing and policy knobs for one tab's session machine.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Give up blocking on the initial `get_session` after this long.
    pub init_timeout: Duration,
    /// Recurring refresh/marker tick.
    pub tick_interval: Duration,
    /// Refresh proactively once less than this remains.
    pub refresh_window: Duration,
    /// Warn the user once less than this remains.
    pub warn_window: Duration,
    /// Markers not renewed within this bound are stale.
    pub marker_ttl: Duration,
    pub profile_cache_ttl: Duration,
    pub sweep_interval: Duration,
    /// Upper bound on any single identity call made on the user's behalf.
    pub adapter_timeout: Duration,
    /// Consecutive failed pulls before the user is told the service is down.
    pub unreachable_notice_after: u32,
    pub sign_out_scope: SignOutScope,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            init_timeout: DEFAULT_INIT_TIMEOUT,
            tick_interval: Duration::from_secs(5 * 60),
            refresh_window: Duration::from_secs(60 * 60),
            warn_window: Duration::from_secs(10 * 60),
            marker_ttl: Duration::from_secs(15 * 60),
            profile_cache_ttl: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(60 * 60),
            adapter_timeout: Duration::from_secs(10),
            unreachable_notice_after: 3,
            sign_out_scope: SignOutScope::Global,
        }
    }
}

/// One bazaar tab: session lifecycle over a shared state directory.
#[derive(Debug, Clone, Parser)]
#[command(name = "bazaar-tab", version, about)]
pub struct TabConfig {
    /// Base URL of the hosted identity service.
    #[arg(long, env = "BAZAAR_IDENTITY_URL")]
    pub identity_url: String,

    /// Public API key sent with every identity request.
    #[arg(long, env = "BAZAAR_API_KEY", default_value = "")]
    pub api_key: String,

    /// Key under which the identity adapter keeps its raw token.
    #[arg(long, env = "BAZAAR_TOKEN_KEY", default_value = "auth.token")]
    pub token_key: String,

    /// Shared state directory. Every tab pointed at the same directory is
    /// part of the same origin.
    #[arg(long, env = "BAZAAR_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Host for the local session API.
    #[arg(long, default_value = "127.0.0.1", env = "BAZAAR_HOST")]
    pub host: String,

    /// Port for the local session API (0 picks a free port).
    #[arg(long, default_value_t = 0, env = "BAZAAR_PORT")]
    pub port: u16,

    #[arg(long, default_value_t = 3000, env = "BAZAAR_INIT_TIMEOUT_MS")]
    pub init_timeout_ms: u64,

    #[arg(long, default_value_t = 300, env = "BAZAAR_TICK_SECS")]
    pub tick_secs: u64,

    #[arg(long, default_value_t = 3600, env = "BAZAAR_REFRESH_WINDOW_SECS")]
    pub refresh_window_secs: u64,

    #[arg(long, default_value_t = 600, env = "BAZAAR_WARN_WINDOW_SECS")]
    pub warn_window_secs: u64,

    #[arg(long, default_value_t = 900, env = "BAZAAR_MARKER_TTL_SECS")]
    pub marker_ttl_secs: u64,

    #[arg(long, default_value_t = 3600, env = "BAZAAR_SWEEP_SECS")]
    pub sweep_secs: u64,

    /// Sign-out scope used by logout (local, global).
    #[arg(long, default_value = "global", env = "BAZAAR_SIGN_OUT_SCOPE")]
    pub sign_out_scope: SignOutScope,

    /// Log level filter.
    #[arg(long, default_value = "info", env = "BAZAAR_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text, json).
    #[arg(long, default_value = "text", env = "BAZAAR_LOG_FORMAT")]
    pub log_format: String,
}

impl TabConfig {
    pub fn settings(&self) -> SessionSettings {
        SessionSettings {
            init_timeout: Duration::from_millis(self.init_timeout_ms),
            tick_interval: Duration::from_secs(self.tick_secs),
            refresh_window: Duration::from_secs(self.refresh_window_secs),
            warn_window: Duration::from_secs(self.warn_window_secs),
            marker_ttl: Duration::from_secs(self.marker_ttl_secs),
            sweep_interval: Duration::from_secs(self.sweep_secs),
            sign_out_scope: self.sign_out_scope,
            ..SessionSettings::default()
        }
    }

    /// Reject configurations that would make the refresh policy incoherent.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.identity_url.trim().is_empty() {
            anyhow::bail!("--identity-url must not be empty");
        }
        if self.tick_secs == 0 {
            anyhow::bail!("--tick-secs must be positive");
        }
        if self.sweep_secs == 0 {
            anyhow::bail!("--sweep-secs must be positive");
        }
        if self.token_key.starts_with(ENVELOPE_NAMESPACE) {
            anyhow::bail!("--token-key must not live under {ENVELOPE_NAMESPACE:?}");
        }
        if self.warn_window_secs > self.refresh_window_secs {
            anyhow::bail!("--warn-window-secs must not exceed --refresh-window-secs");
        }
        if self.marker_ttl_secs <= self.tick_secs {
            anyhow::bail!("--marker-ttl-secs must exceed --tick-secs or live markers go stale");
        }
        Ok(())
    }

    pub fn resolved_state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(state_dir)
    }
}

/// Resolve the default shared state directory.
///
/// Checks `BAZAAR_STATE_DIR`, then `$XDG_STATE_HOME/bazaar`,
/// then `$HOME/.local/state/bazaar`.
pub fn state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("BAZAAR_STATE_DIR") {
        return PathBuf::from(dir);
    }
    if let Ok(xdg) = std::env::var("XDG_STATE_HOME") {
        return PathBuf::from(xdg).join("bazaar");
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local/state/bazaar");
    }
    PathBuf::from(".bazaar")
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
