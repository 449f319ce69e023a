// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Harness for multi-tab scenarios.
//!
//! A [`TabCluster`] is one origin: a shared store, one fake identity service
//! and a manual clock. Every [`Tab`] opened on it gets its own store context,
//! identity adapter, session machine and broadcaster, just like a browser tab.

use std::sync::Arc;
use std::time::Duration;

use bazaar_session::broadcaster::{self, KeyFilter};
use bazaar_session::config::SessionSettings;
use bazaar_session::identity::IdentityService;
use bazaar_session::machine::{SessionDeps, SessionMachine};
use bazaar_session::markers::MARKER_PREFIX;
use bazaar_session::state::{Phase, SessionSnapshot};
use bazaar_session::test_support::{FakeIdentity, FakeIdentityBackend};
use bazaar_store::{ExpiringStorage, FileKv, ManualClock, MemoryKv, PersistentKv};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const START_MS: u64 = 1_700_000_000_000;
pub const EMAIL: &str = "ada@example.com";
pub const PASSWORD: &str = "correct horse";
pub const USER_ID: &str = "u-ada";

/// Generous bound for anything crossing a filesystem watcher.
pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Where the tabs' shared state lives.
enum Substrate {
    Memory(MemoryKv),
    Files(tempfile::TempDir),
}

pub struct TabCluster {
    substrate: Substrate,
    clock: Arc<ManualClock>,
    backend: FakeIdentityBackend,
    settings: SessionSettings,
}

/// One running tab.
pub struct Tab {
    pub machine: SessionMachine,
    pub identity: Arc<FakeIdentity>,
    pub storage: ExpiringStorage,
    shutdown: CancellationToken,
    broadcaster: JoinHandle<()>,
}

impl TabCluster {
    /// Tabs in one process sharing an in-memory store.
    pub fn in_memory() -> Self {
        Self::on(Substrate::Memory(MemoryKv::new()))
    }

    /// Tabs sharing a state directory, each with its own handle.
    pub fn on_disk() -> anyhow::Result<Self> {
        Ok(Self::on(Substrate::Files(tempfile::tempdir()?)))
    }

    fn on(substrate: Substrate) -> Self {
        let clock = Arc::new(ManualClock::new(START_MS));
        let backend = FakeIdentityBackend::new(clock.clone());
        backend.add_user(EMAIL, PASSWORD, USER_ID, Some("Ada Lovelace"));
        Self { substrate, clock, backend, settings: SessionSettings::default() }
    }

    pub fn with_settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn clock(&self) -> &Arc<ManualClock> {
        &self.clock
    }

    pub fn backend(&self) -> &FakeIdentityBackend {
        &self.backend
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// A fresh handle onto the shared store, for inspection.
    pub fn view(&self) -> anyhow::Result<Arc<dyn PersistentKv>> {
        Ok(match &self.substrate {
            Substrate::Memory(kv) => Arc::new(kv.context()),
            Substrate::Files(dir) => Arc::new(FileKv::open(dir.path())?),
        })
    }

    pub fn marker_keys(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.view()?.keys().into_iter().filter(|k| k.starts_with(MARKER_PREFIX)).collect())
    }

    /// Open a tab whose adapter shares the origin's token key.
    pub fn open_tab(&self) -> anyhow::Result<Tab> {
        let kv = self.view()?;
        let identity = Arc::new(FakeIdentity::new(self.backend.clone(), Arc::clone(&kv)));
        Ok(self.start(kv, identity))
    }

    /// Open a tab that keeps its token under its own key, so it can hold a
    /// different session from its siblings.
    pub fn open_isolated_tab(&self, token_key: &str) -> anyhow::Result<Tab> {
        let kv = self.view()?;
        let identity =
            Arc::new(FakeIdentity::with_token_key(self.backend.clone(), Arc::clone(&kv), token_key));
        Ok(self.start(kv, identity))
    }

    fn start(&self, kv: Arc<dyn PersistentKv>, identity: Arc<FakeIdentity>) -> Tab {
        let storage = ExpiringStorage::new(Arc::clone(&kv), self.clock.clone());
        let feed = kv.subscribe();
        let filter = KeyFilter::for_session(identity.storage_key());
        let machine = SessionMachine::start(
            SessionDeps { identity: identity.clone(), storage: storage.clone() },
            self.settings.clone(),
        );
        let shutdown = CancellationToken::new();
        let broadcaster = broadcaster::spawn(feed, filter, machine.clone(), shutdown.clone());
        Tab { machine, identity, storage, shutdown, broadcaster }
    }
}

impl Tab {
    /// Wait until initialization is over.
    pub async fn settled(&self) -> SessionSnapshot {
        self.machine.wait_for(|s| !s.is_initializing && s.phase != Phase::Uninitialized).await
    }

    /// Wait for a snapshot matching `pred`, failing after [`TIMEOUT`].
    pub async fn expect(
        &self,
        what: &str,
        pred: impl FnMut(&SessionSnapshot) -> bool,
    ) -> anyhow::Result<SessionSnapshot> {
        tokio::time::timeout(TIMEOUT, self.machine.wait_for(pred))
            .await
            .map_err(|_| anyhow::anyhow!("timed out waiting for {what}: {:?}", self.machine.snapshot()))
    }

    pub async fn login(&self) -> anyhow::Result<SessionSnapshot> {
        anyhow::ensure!(self.machine.login(EMAIL, PASSWORD).await, "login rejected");
        Ok(self.machine.snapshot())
    }

    pub async fn close(self) {
        self.shutdown.cancel();
        let _ = self.broadcaster.await;
        self.machine.close().await;
    }
}
