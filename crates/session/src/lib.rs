// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bazaar tab session: who is signed in, kept consistent across tabs.

pub mod broadcaster;
pub mod config;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod guard;
pub mod identity;
pub mod machine;
pub mod markers;
pub mod profile;
pub mod scheduler;
pub mod state;
pub mod test_support;
pub mod transport;

use std::sync::Arc;

use bazaar_store::{spawn_sweeper, Clock, ExpiringStorage, FileKv, PersistentKv, SystemClock};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::broadcaster::KeyFilter;
use crate::config::TabConfig;
use crate::identity::http::HttpIdentityConfig;
use crate::identity::{HttpIdentity, IdentityService};
use crate::machine::{SessionDeps, SessionMachine};
use crate::transport::build_router;

/// Run one tab until shutdown.
pub async fn run(config: TabConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    config.validate()?;
    let settings = config.settings();
    let state_dir = config.resolved_state_dir();

    let kv: Arc<dyn PersistentKv> = Arc::new(FileKv::open(&state_dir)?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let storage = ExpiringStorage::new(Arc::clone(&kv), Arc::clone(&clock));

    let identity = HttpIdentity::new(
        HttpIdentityConfig {
            base_url: config.identity_url.clone(),
            api_key: config.api_key.clone(),
            token_key: config.token_key.clone(),
            timeout: settings.adapter_timeout,
        },
        Arc::clone(&kv),
        clock,
    )?;
    let identity: Arc<dyn IdentityService> = Arc::new(identity);

    // Subscribe before the machine's first write so nothing is missed.
    let feed = kv.subscribe();
    let filter = KeyFilter::for_session(identity.storage_key());
    let machine = SessionMachine::start(
        SessionDeps { identity, storage: storage.clone() },
        settings.clone(),
    );
    let broadcaster = broadcaster::spawn(feed, filter, machine.clone(), shutdown.clone());
    let sweeper = spawn_sweeper(storage, settings.sweep_interval, shutdown.clone());

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(
        tab = %machine.tab(),
        addr = %listener.local_addr()?,
        state_dir = %state_dir.display(),
        "bazaar tab listening"
    );

    let router = build_router(machine.clone());
    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await;

    shutdown.cancel();
    let _ = broadcaster.await;
    let _ = sweeper.await;
    machine.close().await;
    served?;
    Ok(())
}
