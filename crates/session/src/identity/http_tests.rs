// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode as AxumStatus;
use axum::routing::{get, post};
use axum::Router;
use bazaar_store::{ManualClock, MemoryKv, PersistentKv};
use parking_lot::Mutex;
use tokio::net::TcpListener;

use super::*;
use crate::identity::token_store::DEFAULT_TOKEN_KEY;
use crate::identity::IdentityClaims;

const START_MS: u64 = 1_700_000_000_000;

/// Canned responses and call records for the mock identity service.
struct Mock {
    password: Mutex<(u16, String)>,
    refresh: Mutex<(u16, String)>,
    logout: Mutex<u16>,
    profiles: Mutex<(u16, String)>,
    refresh_calls: AtomicU32,
    logout_scopes: Mutex<Vec<String>>,
    bodies: Mutex<Vec<String>>,
}

impl Default for Mock {
    fn default() -> Self {
        Self {
            password: Mutex::new((200, token_body("tok-signed-in-00000001", "r1"))),
            refresh: Mutex::new((200, token_body("tok-refreshed-0000002", "r2"))),
            logout: Mutex::new(204),
            profiles: Mutex::new((200, "[]".to_owned())),
            refresh_calls: AtomicU32::new(0),
            logout_scopes: Mutex::new(Vec::new()),
            bodies: Mutex::new(Vec::new()),
        }
    }
}

fn token_body(access: &str, refresh: &str) -> String {
    serde_json::json!({
        "access_token": access,
        "token_type": "bearer",
        "expires_in": 3600,
        "refresh_token": refresh,
        "user": {
            "id": "u-1",
            "email": "ada@example.com",
            "user_metadata": { "full_name": "Ada Lovelace" }
        }
    })
    .to_string()
}

fn reply((status, body): (u16, String)) -> (AxumStatus, String) {
    (AxumStatus::from_u16(status).unwrap_or(AxumStatus::INTERNAL_SERVER_ERROR), body)
}

async fn token(
    State(mock): State<Arc<Mock>>,
    Query(q): Query<HashMap<String, String>>,
    body: String,
) -> (AxumStatus, String) {
    mock.bodies.lock().push(body);
    match q.get("grant_type").map(String::as_str) {
        Some("password") => reply(mock.password.lock().clone()),
        Some("refresh_token") => {
            mock.refresh_calls.fetch_add(1, Ordering::Relaxed);
            reply(mock.refresh.lock().clone())
        }
        _ => reply((400, "{\"error\":\"unsupported_grant_type\"}".to_owned())),
    }
}

async fn logout(
    State(mock): State<Arc<Mock>>,
    Query(q): Query<HashMap<String, String>>,
) -> AxumStatus {
    mock.logout_scopes.lock().push(q.get("scope").cloned().unwrap_or_default());
    AxumStatus::from_u16(*mock.logout.lock()).unwrap_or(AxumStatus::INTERNAL_SERVER_ERROR)
}

async fn profiles(State(mock): State<Arc<Mock>>) -> (AxumStatus, String) {
    reply(mock.profiles.lock().clone())
}

async fn mock_identity_server(mock: Arc<Mock>) -> SocketAddr {
    let app = Router::new()
        .route("/auth/v1/token", post(token))
        .route("/auth/v1/logout", post(logout))
        .route("/rest/v1/profiles", get(profiles))
        .with_state(mock);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    addr
}

struct Fixture {
    identity: HttpIdentity,
    kv: MemoryKv,
    clock: Arc<ManualClock>,
    mock: Arc<Mock>,
}

async fn fixture() -> anyhow::Result<Fixture> {
    let mock = Arc::new(Mock::default());
    let addr = mock_identity_server(Arc::clone(&mock)).await;
    let kv = MemoryKv::new();
    let clock = Arc::new(ManualClock::new(START_MS));
    let identity = HttpIdentity::new(
        HttpIdentityConfig {
            base_url: format!("http://{addr}/"),
            api_key: "anon".into(),
            token_key: DEFAULT_TOKEN_KEY.into(),
            timeout: Duration::from_secs(5),
        },
        Arc::new(kv.context()),
        clock.clone(),
    )?;
    Ok(Fixture { identity, kv, clock, mock })
}

fn credentials() -> Credentials {
    Credentials { email: "ada@example.com".into(), password: "hunter2".into() }
}

fn stored(access: &str, expires_at: u64) -> Session {
    Session {
        user_id: "u-1".into(),
        access_token: access.into(),
        refresh_token: "r0".into(),
        expires_at,
        claims: IdentityClaims::default(),
    }
}

#[tokio::test]
async fn sign_in_stores_token_and_emits() -> anyhow::Result<()> {
    let f = fixture().await?;
    let mut events = f.identity.subscribe();

    let session = f.identity.sign_in_with_password(&credentials()).await?;
    assert_eq!(session.user_id, "u-1");
    assert_eq!(session.expires_at, START_MS + 3_600_000);
    assert_eq!(session.claims.name.as_deref(), Some("Ada Lovelace"));

    // Another tab on the same store sees the token.
    let other = TokenStore::new(Arc::new(f.kv.context()), DEFAULT_TOKEN_KEY);
    assert_eq!(other.load(), Some(session.clone()));

    let event = events.recv().await?;
    assert_eq!(event.kind, AuthEventKind::SignedIn);
    assert_eq!(event.session, Some(session));

    let body = f.mock.bodies.lock().first().cloned().unwrap_or_default();
    assert!(body.contains("ada@example.com"));
    Ok(())
}

#[yare::parameterized(
    legacy_shape = { 400, "{\"error\":\"invalid_grant\",\"error_description\":\"Invalid login credentials\"}" },
    coded_shape = { 400, "{\"code\":400,\"error_code\":\"invalid_credentials\",\"msg\":\"Invalid login credentials\"}" },
)]
#[test_macro(tokio::test)]
async fn bad_password_is_invalid_credentials(status: u16, body: &str) -> anyhow::Result<()> {
    let f = fixture().await?;
    *f.mock.password.lock() = (status, body.to_owned());

    let err = f.identity.sign_in_with_password(&credentials()).await.err();
    assert_eq!(err, Some(AdapterError::InvalidCredentials));
    assert!(f.kv.get(DEFAULT_TOKEN_KEY).is_none());
    Ok(())
}

#[tokio::test]
async fn unexpired_session_is_returned_without_refresh() -> anyhow::Result<()> {
    let f = fixture().await?;
    let tokens = TokenStore::new(Arc::new(f.kv.context()), DEFAULT_TOKEN_KEY);
    tokens.save(&stored("tok-still-valid-000001", START_MS + 60_000));

    let session = f.identity.get_session().await?;
    assert_eq!(session.map(|s| s.access_token).as_deref(), Some("tok-still-valid-000001"));
    assert_eq!(f.mock.refresh_calls.load(Ordering::Relaxed), 0);
    Ok(())
}

#[tokio::test]
async fn expired_session_is_refreshed_on_read() -> anyhow::Result<()> {
    let f = fixture().await?;
    let mut events = f.identity.subscribe();
    let tokens = TokenStore::new(Arc::new(f.kv.context()), DEFAULT_TOKEN_KEY);
    tokens.save(&stored("tok-old-000000000001", START_MS + 1_000));
    f.clock.advance(Duration::from_secs(2));

    let session = f.identity.get_session().await?;
    assert_eq!(session.map(|s| s.access_token).as_deref(), Some("tok-refreshed-0000002"));
    assert_eq!(f.mock.refresh_calls.load(Ordering::Relaxed), 1);
    assert_eq!(tokens.load().map(|s| s.refresh_token).as_deref(), Some("r2"));
    assert_eq!(events.recv().await?.kind, AuthEventKind::TokenRefreshed);
    Ok(())
}

#[tokio::test]
async fn revoked_refresh_token_signs_out_locally() -> anyhow::Result<()> {
    let f = fixture().await?;
    *f.mock.refresh.lock() = (
        400,
        "{\"error\":\"invalid_grant\",\"error_description\":\"Refresh Token Not Found\"}".to_owned(),
    );
    let mut events = f.identity.subscribe();
    let tokens = TokenStore::new(Arc::new(f.kv.context()), DEFAULT_TOKEN_KEY);
    tokens.save(&stored("tok-old-000000000001", START_MS));

    assert_eq!(f.identity.get_session().await?, None);
    assert!(f.kv.get(DEFAULT_TOKEN_KEY).is_none());
    assert_eq!(events.recv().await?.kind, AuthEventKind::SignedOut);
    Ok(())
}

#[tokio::test]
async fn server_error_on_refresh_keeps_token() -> anyhow::Result<()> {
    let f = fixture().await?;
    *f.mock.refresh.lock() = (503, "{\"message\":\"maintenance\"}".to_owned());
    let tokens = TokenStore::new(Arc::new(f.kv.context()), DEFAULT_TOKEN_KEY);
    tokens.save(&stored("tok-near-expiry-00001", START_MS + 60_000));

    let err = f.identity.refresh_session().await.err();
    assert_eq!(err, Some(AdapterError::Rejected { status: 503, message: "maintenance".into() }));
    assert!(err.is_some_and(|e| e.is_transient()));
    assert!(tokens.load().is_some());
    Ok(())
}

#[tokio::test]
async fn refresh_adopts_token_rotated_by_another_tab() -> anyhow::Result<()> {
    let f = fixture().await?;
    let tokens = TokenStore::new(Arc::new(f.kv.context()), DEFAULT_TOKEN_KEY);
    tokens.save(&stored("tok-old-000000000001", START_MS));
    f.clock.advance(Duration::from_secs(1));

    // Another tab rotates the token before this one gets to it.
    let seen = stored("tok-old-000000000001", START_MS);
    tokens.save(&stored("tok-rotated-elsewhere", START_MS + 3_600_000));

    let session = f.identity.refresh_stored(&seen).await?;
    assert_eq!(session.map(|s| s.access_token).as_deref(), Some("tok-rotated-elsewhere"));
    assert_eq!(f.mock.refresh_calls.load(Ordering::Relaxed), 0);
    Ok(())
}

#[yare::parameterized(
    global_ok = { SignOutScope::Global, 204, true },
    local_ok = { SignOutScope::Local, 204, true },
    already_revoked = { SignOutScope::Global, 401, true },
    server_down = { SignOutScope::Global, 500, false },
)]
#[test_macro(tokio::test)]
async fn sign_out_always_drops_local_token(
    scope: SignOutScope,
    status: u16,
    succeeds: bool,
) -> anyhow::Result<()> {
    let f = fixture().await?;
    *f.mock.logout.lock() = status;
    let mut events = f.identity.subscribe();
    f.identity.sign_in_with_password(&credentials()).await?;
    assert_eq!(events.recv().await?.kind, AuthEventKind::SignedIn);

    let result = f.identity.sign_out(scope).await;
    assert_eq!(result.is_ok(), succeeds);
    assert!(f.kv.get(DEFAULT_TOKEN_KEY).is_none());
    assert_eq!(events.recv().await?.kind, AuthEventKind::SignedOut);
    assert_eq!(f.mock.logout_scopes.lock().clone(), vec![scope.as_str().to_owned()]);
    Ok(())
}

#[tokio::test]
async fn profile_lookup() -> anyhow::Result<()> {
    let f = fixture().await?;
    assert_eq!(f.identity.get_profile("u-1").await?, None);

    *f.mock.profiles.lock() = (
        200,
        serde_json::json!([{ "id": "u-1", "display_name": "Ada", "username": "ada" }]).to_string(),
    );
    let profile = f.identity.get_profile("u-1").await?;
    assert_eq!(profile.as_ref().and_then(|p| p.display_name.as_deref()), Some("Ada"));
    assert_eq!(profile.as_ref().and_then(|p| p.username.as_deref()), Some("ada"));

    *f.mock.profiles.lock() = (500, "{}".to_owned());
    assert!(matches!(
        f.identity.get_profile("u-1").await,
        Err(AdapterError::Rejected { status: 500, .. })
    ));
    Ok(())
}

#[tokio::test]
async fn unreachable_service_is_classified() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);

    let identity = HttpIdentity::new(
        HttpIdentityConfig {
            base_url: format!("http://{addr}"),
            api_key: String::new(),
            token_key: DEFAULT_TOKEN_KEY.into(),
            timeout: Duration::from_secs(2),
        },
        Arc::new(MemoryKv::new()),
        Arc::new(ManualClock::new(START_MS)),
    )?;

    let err = identity.sign_in_with_password(&credentials()).await.err();
    assert!(matches!(err, Some(AdapterError::Unreachable(_))));
    assert_eq!(identity.storage_key().as_deref(), Some(DEFAULT_TOKEN_KEY));
    Ok(())
}
