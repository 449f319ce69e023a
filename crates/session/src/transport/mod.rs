// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Local HTTP API over one tab's session.

pub mod http;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::machine::SessionMachine;

/// Shared state for handlers.
pub struct ApiState {
    pub machine: SessionMachine,
}

/// Build the axum `Router` with all session routes.
pub fn build_router(machine: SessionMachine) -> Router {
    let state = Arc::new(ApiState { machine });
    Router::new()
        .route("/api/v1/health", get(http::health))
        .route("/api/v1/session", get(http::session))
        .route("/api/v1/session/login", post(http::login))
        .route("/api/v1/session/logout", post(http::logout))
        .route("/api/v1/session/refresh", post(http::refresh))
        .route("/api/v1/session/guard", get(http::guard))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
