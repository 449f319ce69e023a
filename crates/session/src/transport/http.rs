// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP handlers for the local session API.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::guard::{self, GuardDecision, RouteKind};
use crate::identity::{Credentials, SignOutScope};
use crate::scheduler::RefreshOutcome;
use crate::state::SessionSnapshot;
use crate::transport::ApiState;

// -- Request/Response types ---------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub tab: String,
    pub phase: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub ok: bool,
    pub session: SessionSnapshot,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogoutQuery {
    #[serde(default)]
    pub scope: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LogoutResponse {
    pub ok: bool,
    pub scope: String,
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub outcome: &'static str,
    /// Epoch ms.
    pub session_expiry: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct GuardQuery {
    pub route: String,
}

#[derive(Debug, Serialize)]
pub struct GuardResponse {
    pub route: RouteKind,
    pub decision: GuardDecision,
}

fn outcome_name(outcome: &RefreshOutcome) -> &'static str {
    match outcome {
        RefreshOutcome::NotDue => "not_due",
        RefreshOutcome::InFlight => "in_flight",
        RefreshOutcome::Refreshed(_) => "refreshed",
        RefreshOutcome::NoSession => "no_session",
        RefreshOutcome::Failed(_) => "failed",
    }
}

// -- Handlers -----------------------------------------------------------------

/// `GET /api/v1/health`
pub async fn health(State(s): State<Arc<ApiState>>) -> impl IntoResponse {
    let snapshot = s.machine.snapshot();
    Json(HealthResponse {
        status: "running".to_owned(),
        tab: s.machine.tab().to_owned(),
        phase: snapshot.phase.as_str().to_owned(),
    })
}

/// `GET /api/v1/session`
///
/// Current snapshot. Never blocks on the adapter.
pub async fn session(State(s): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(s.machine.snapshot())
}

/// `POST /api/v1/session/login`
pub async fn login(
    State(s): State<Arc<ApiState>>,
    Json(req): Json<Credentials>,
) -> impl IntoResponse {
    if req.email.trim().is_empty() || req.password.is_empty() {
        return ErrorCode::BadRequest
            .to_http_response("email and password are required")
            .into_response();
    }
    if !s.machine.login(req.email.trim(), &req.password).await {
        return ErrorCode::Unauthorized
            .to_http_response("invalid email or password")
            .into_response();
    }
    Json(LoginResponse { ok: true, session: s.machine.snapshot() }).into_response()
}

/// `POST /api/v1/session/logout?scope=local|global`
pub async fn logout(
    State(s): State<Arc<ApiState>>,
    Query(q): Query<LogoutQuery>,
) -> impl IntoResponse {
    let scope = match q.scope.as_deref() {
        None => s.machine.settings().sign_out_scope,
        Some(raw) => match raw.parse::<SignOutScope>() {
            Ok(scope) => scope,
            Err(e) => return ErrorCode::BadRequest.to_http_response(e.to_string()).into_response(),
        },
    };
    s.machine.logout_with_scope(scope).await;
    Json(LogoutResponse { ok: true, scope: scope.as_str().to_owned() }).into_response()
}

/// `POST /api/v1/session/refresh`
///
/// Refreshes only inside the refresh window.
pub async fn refresh(State(s): State<Arc<ApiState>>) -> impl IntoResponse {
    if s.machine.snapshot().is_initializing {
        return ErrorCode::NotReady.to_http_response("session is initializing").into_response();
    }
    let outcome = s.machine.refresh_session().await;
    let session_expiry = match &outcome {
        RefreshOutcome::NoSession => {
            return ErrorCode::Unauthorized.to_http_response("no session to refresh").into_response();
        }
        RefreshOutcome::Failed(e) => {
            return ErrorCode::IdentityUnavailable.to_http_response(e.to_string()).into_response();
        }
        RefreshOutcome::Refreshed(session) => Some(session.expires_at),
        RefreshOutcome::NotDue | RefreshOutcome::InFlight => s.machine.snapshot().session_expiry,
    };
    Json(RefreshResponse { outcome: outcome_name(&outcome), session_expiry }).into_response()
}

/// `GET /api/v1/session/guard?route=public|protected|sensitive`
pub async fn guard(
    State(s): State<Arc<ApiState>>,
    Query(q): Query<GuardQuery>,
) -> impl IntoResponse {
    let route = match q.route.parse::<RouteKind>() {
        Ok(route) => route,
        Err(e) => return ErrorCode::BadRequest.to_http_response(e.to_string()).into_response(),
    };
    let decision = guard::guard(&s.machine, route).await;
    Json(GuardResponse { route, decision }).into_response()
}
