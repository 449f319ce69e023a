// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;

use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

/// Failure talking to the identity service.
///
/// Adapter failures never escape into callers as panics or opaque errors;
/// the session machine pattern-matches on the kind to decide whether to
/// retry, degrade, or accept the answer as authoritative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// Connection failed or the service is down.
    Unreachable(String),
    /// The call did not complete in time.
    Timeout,
    /// Email/password rejected at sign-in.
    InvalidCredentials,
    /// The refresh token is no longer accepted.
    InvalidGrant(String),
    /// Any other non-success response.
    Rejected { status: u16, message: String },
    /// The response could not be understood.
    Malformed(String),
}

impl AdapterError {
    /// Whether retrying later may succeed without user action.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unreachable(_) | Self::Timeout => true,
            Self::Rejected { status, .. } => *status >= 500 || *status == 429,
            Self::InvalidCredentials | Self::InvalidGrant(_) | Self::Malformed(_) => false,
        }
    }

    pub fn from_reqwest(e: &reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_decode() {
            Self::Malformed(e.to_string())
        } else {
            Self::Unreachable(e.to_string())
        }
    }
}

impl fmt::Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unreachable(msg) => write!(f, "identity service unreachable: {msg}"),
            Self::Timeout => f.write_str("identity service timed out"),
            Self::InvalidCredentials => f.write_str("invalid email or password"),
            Self::InvalidGrant(msg) => write!(f, "refresh token rejected: {msg}"),
            Self::Rejected { status, message } => write!(f, "rejected ({status}): {message}"),
            Self::Malformed(msg) => write!(f, "malformed response: {msg}"),
        }
    }
}

impl std::error::Error for AdapterError {}

/// Error codes for the local session API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Unauthorized,
    BadRequest,
    NotReady,
    IdentityUnavailable,
    Internal,
}

impl ErrorCode {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Unauthorized => 401,
            Self::BadRequest => 400,
            Self::NotReady => 503,
            Self::IdentityUnavailable => 502,
            Self::Internal => 500,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::BadRequest => "BAD_REQUEST",
            Self::NotReady => "NOT_READY",
            Self::IdentityUnavailable => "IDENTITY_UNAVAILABLE",
            Self::Internal => "INTERNAL",
        }
    }

    pub fn to_error_body(&self, message: impl Into<String>) -> ErrorBody {
        ErrorBody { code: self.as_str().to_owned(), message: message.into() }
    }

    pub fn to_http_response(
        &self,
        message: impl Into<String>,
    ) -> (StatusCode, Json<ErrorResponse>) {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorResponse { error: self.to_error_body(message) };
        (status, Json(body))
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

/// Error body with machine-readable code and human-readable message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
