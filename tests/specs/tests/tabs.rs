// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Multi-tab scenarios: several session machines over one shared store and
//! one identity service.

use std::time::Duration;

use bazaar_session::events::Notice;
use bazaar_session::fingerprint::Fingerprint;
use bazaar_session::identity::SignOutScope;
use bazaar_session::markers::marker_key;
use bazaar_session::profile::PROFILE_CACHE_KEY;
use bazaar_session::state::Phase;
use bazaar_specs::{TabCluster, TIMEOUT};
use bazaar_store::ExpiringStorage;

// -- Fingerprints -------------------------------------------------------------

#[tokio::test]
async fn same_token_has_same_fingerprint_in_every_tab() -> anyhow::Result<()> {
    let cluster = TabCluster::in_memory();
    let tab1 = cluster.open_tab()?;
    tab1.settled().await;
    let s1 = tab1.login().await?;

    let tab2 = cluster.open_tab()?;
    let s2 = tab2.expect("tab 2 to pick up the session", |s| s.is_authenticated).await?;

    assert!(s1.fingerprint.is_some());
    assert_eq!(s1.fingerprint, s2.fingerprint);
    // One token, one marker.
    assert_eq!(cluster.marker_keys()?.len(), 1);

    tab2.close().await;
    tab1.close().await;
    Ok(())
}

// -- Concurrent sessions ------------------------------------------------------

#[tokio::test]
async fn sequential_sign_ins_see_each_other() -> anyhow::Result<()> {
    let cluster = TabCluster::in_memory();
    let tab1 = cluster.open_tab()?;
    let tab2 = cluster.open_tab()?;
    tab1.settled().await;
    tab2.settled().await;

    let fp1 = tab1
        .login()
        .await?
        .fingerprint
        .ok_or_else(|| anyhow::anyhow!("tab 1 has no fingerprint"))?;
    tab2.expect("tab 2 to pick up the first session", |s| s.fingerprint.as_ref() == Some(&fp1))
        .await?;
    assert!(!tab1.machine.snapshot().has_other_sessions);

    // Signing in again replaces the origin's token; the first session's
    // marker stays until it ages out.
    let s2 = tab2.login().await?;
    assert_ne!(s2.fingerprint.as_ref(), Some(&fp1));

    tab2.expect("tab 2 to notice the first session", |s| s.has_other_sessions).await?;
    tab1.expect("tab 1 to notice the second session", |s| s.has_other_sessions).await?;
    let keys = cluster.marker_keys()?;
    assert_eq!(keys.len(), 2);
    assert!(keys.contains(&marker_key(&fp1)));

    tab2.close().await;
    tab1.close().await;
    Ok(())
}

#[tokio::test]
async fn sweeps_never_take_live_markers_of_other_tabs() -> anyhow::Result<()> {
    let cluster = TabCluster::in_memory();
    let tab1 = cluster.open_isolated_tab("auth.token.tab1")?;
    let tab2 = cluster.open_isolated_tab("auth.token.tab2")?;
    tab1.settled().await;
    tab2.settled().await;
    tab1.login().await?;
    let fp2 = tab2
        .login()
        .await?
        .fingerprint
        .ok_or_else(|| anyhow::anyhow!("tab 2 has no fingerprint"))?;
    let theirs = marker_key(&fp2);

    tab1.machine.logout_with_scope(SignOutScope::Local).await;
    assert_eq!(cluster.marker_keys()?, vec![theirs.clone()]);

    tab1.storage.sweep();
    assert_eq!(cluster.marker_keys()?, vec![theirs.clone()]);
    tab1.close().await;
    assert_eq!(cluster.marker_keys()?, vec![theirs.clone()]);

    // Only age takes it.
    cluster.clock().advance(cluster.settings().marker_ttl + Duration::from_secs(60));
    let janitor = ExpiringStorage::new(cluster.view()?, cluster.clock().clone());
    assert!(janitor.sweep() >= 1);
    assert!(cluster.marker_keys()?.is_empty());

    tab2.close().await;
    Ok(())
}

// -- Sign-out propagation -----------------------------------------------------

async fn global_sign_out_reaches_other_tab(cluster: TabCluster) -> anyhow::Result<()> {
    let tab1 = cluster.open_tab()?;
    tab1.settled().await;
    tab1.login().await?;

    let tab2 = cluster.open_tab()?;
    tab2.expect("tab 2 authenticated with a cached profile", |s| {
        s.is_authenticated && s.cached_profile.is_some()
    })
    .await?;
    let reads_before = tab2.identity.calls().get_session();
    let mut notices = tab2.machine.notices();

    tab1.machine.logout_with_scope(SignOutScope::Global).await;

    let after = tab2.expect("tab 2 signed out", |s| s.phase == Phase::Unauthenticated).await?;
    assert!(!after.is_authenticated);
    assert_eq!(after.user, None);
    assert_eq!(after.cached_profile, None);
    assert!(tab2.identity.calls().get_session() > reads_before);

    let told = tokio::time::timeout(TIMEOUT, async {
        loop {
            match notices.recv().await {
                Ok(Notice::SignedOutElsewhere) => return true,
                Ok(_) => continue,
                Err(_) => return false,
            }
        }
    })
    .await?;
    assert!(told);
    assert!(cluster.view()?.get(PROFILE_CACHE_KEY).is_none());

    tab2.close().await;
    tab1.close().await;
    Ok(())
}

#[tokio::test]
async fn global_sign_out_reaches_other_tab_in_memory() -> anyhow::Result<()> {
    global_sign_out_reaches_other_tab(TabCluster::in_memory()).await
}

#[tokio::test]
async fn global_sign_out_reaches_other_tab_on_disk() -> anyhow::Result<()> {
    global_sign_out_reaches_other_tab(TabCluster::on_disk()?).await
}

// -- Token rotation -----------------------------------------------------------

#[tokio::test]
async fn refresh_in_one_tab_is_adopted_by_the_other() -> anyhow::Result<()> {
    let cluster = TabCluster::in_memory();
    cluster.backend().set_token_ttl(Duration::from_secs(30 * 60));
    let tab1 = cluster.open_tab()?;
    tab1.settled().await;
    let before = tab1.login().await?.fingerprint;

    let tab2 = cluster.open_tab()?;
    tab2.expect("tab 2 authenticated", |s| s.is_authenticated && s.fingerprint == before).await?;

    let outcome = tab1.machine.refresh_session().await;
    let rotated = match outcome {
        bazaar_session::scheduler::RefreshOutcome::Refreshed(session) => {
            Fingerprint::from_token(&session.access_token)
        }
        other => anyhow::bail!("expected a refresh, got {other:?}"),
    };

    let snap = tab2
        .expect("tab 2 to adopt the rotated token", |s| s.fingerprint.as_ref() == Some(&rotated))
        .await?;
    assert!(snap.is_authenticated);
    assert_eq!(tab2.identity.calls().refresh_session(), 0);

    tab2.close().await;
    tab1.close().await;
    Ok(())
}
