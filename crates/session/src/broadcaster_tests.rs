// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use bazaar_store::{ExpiringStorage, ManualClock, MemoryKv, PersistentKv};

use super::*;
use crate::config::SessionSettings;
use crate::events::Notice;
use crate::fingerprint::Fingerprint;
use crate::identity::token_store::{StoredSession, DEFAULT_TOKEN_KEY};
use crate::identity::{IdentityClaims, IdentityService, Session};
use crate::machine::SessionDeps;
use crate::profile::PROFILE_CACHE_KEY;
use crate::test_support::ScriptedIdentity;

const START_MS: u64 = 1_700_000_000_000;

fn session(token: &str) -> Session {
    Session {
        user_id: "u-ada".into(),
        access_token: token.into(),
        refresh_token: format!("r-{token}"),
        expires_at: START_MS + 2 * 3_600_000,
        claims: IdentityClaims { email: Some("ada@example.com".into()), ..IdentityClaims::default() },
    }
}

#[yare::parameterized(
    token_key = { Some(DEFAULT_TOKEN_KEY), true },
    marker = { Some("session.active.abcd1234"), true },
    unknown = { None, true },
    profile_cache = { Some(PROFILE_CACHE_KEY), false },
    unrelated = { Some("listing.draft"), false },
)]
fn relevance(key: Option<&str>, relevant: bool) {
    let filter = KeyFilter::for_session(Some(DEFAULT_TOKEN_KEY.to_owned()));
    let change = StorageChange { key: key.map(str::to_owned), old_value: None, new_value: None };
    assert_eq!(filter.is_relevant(&change), relevant);
}

struct Harness {
    machine: SessionMachine,
    identity: Arc<ScriptedIdentity>,
    external: MemoryKv,
    shutdown: CancellationToken,
}

async fn harness(initial: Option<Session>) -> Harness {
    let kv = MemoryKv::new();
    let tab_ctx = kv.context();
    let clock = Arc::new(ManualClock::new(START_MS));
    let identity = Arc::new(ScriptedIdentity::new(initial));
    let storage = ExpiringStorage::new(Arc::new(tab_ctx.clone()), clock);
    let machine = SessionMachine::start(
        SessionDeps { identity: identity.clone(), storage },
        SessionSettings::default(),
    );
    machine.wait_for(|s| !s.is_initializing && s.is_authenticated).await;

    let shutdown = CancellationToken::new();
    let filter = KeyFilter::for_session(identity.storage_key());
    spawn(tab_ctx.subscribe(), filter, machine.clone(), shutdown.clone());
    Harness { machine, identity, external: kv.context(), shutdown }
}

#[tokio::test]
async fn reconciliation_pulls_instead_of_trusting_the_write() -> anyhow::Result<()> {
    let h = harness(Some(session("tok-original-AAAAAAAA"))).await;
    let mut notices = h.machine.notices();
    assert_eq!(h.identity.calls().get_session(), 1);

    // The adapter's truth differs from what the other tab wrote.
    h.identity.set_answer(Ok(Some(session("tok-adapter-YYYYYYYY"))));
    let written = StoredSession::from(&session("tok-written-XXXXXXXX"));
    h.external.set(DEFAULT_TOKEN_KEY, serde_json::to_string(&written)?);

    let snap = tokio::time::timeout(
        Duration::from_secs(5),
        h.machine.wait_for(|s| s.fingerprint != Some(Fingerprint::from_token("AAAAAAAA"))),
    )
    .await?;
    assert_eq!(snap.fingerprint, Some(Fingerprint::from_token("YYYYYYYY")));
    assert_eq!(h.identity.calls().get_session(), 2);

    let notice = tokio::time::timeout(Duration::from_secs(5), notices.recv()).await??;
    assert_eq!(
        notice,
        Notice::SessionChangedElsewhere { fingerprint: Fingerprint::from_token("YYYYYYYY") }
    );

    h.shutdown.cancel();
    h.machine.close().await;
    Ok(())
}

#[tokio::test]
async fn removal_elsewhere_signs_out_here() -> anyhow::Result<()> {
    let h = harness(Some(session("tok-original-AAAAAAAA"))).await;
    let mut notices = h.machine.notices();

    h.identity.set_answer(Ok(None));
    h.external.set(DEFAULT_TOKEN_KEY, "{}".to_owned());
    h.external.remove(DEFAULT_TOKEN_KEY);

    let snap =
        tokio::time::timeout(Duration::from_secs(5), h.machine.wait_for(|s| !s.is_authenticated))
            .await?;
    assert_eq!(snap.user, None);
    let notice = tokio::time::timeout(Duration::from_secs(5), notices.recv()).await??;
    assert_eq!(notice, Notice::SignedOutElsewhere);

    h.shutdown.cancel();
    h.machine.close().await;
    Ok(())
}

#[tokio::test]
async fn irrelevant_writes_are_ignored() -> anyhow::Result<()> {
    let h = harness(Some(session("tok-original-AAAAAAAA"))).await;

    h.external.set("listing.draft", "{\"title\":\"bike\"}".to_owned());
    h.external.set(PROFILE_CACHE_KEY, "{}".to_owned());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.identity.calls().get_session(), 1);

    // A relevant write afterwards still gets through.
    h.external.set("session.active.ZZZZZZZZ", "{}".to_owned());
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.identity.calls().get_session() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;

    h.shutdown.cancel();
    h.machine.close().await;
    Ok(())
}
