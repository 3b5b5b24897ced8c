// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of wandersphere.
//
// wandersphere is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// wandersphere is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with wandersphere.  If not,
// see <http://www.gnu.org/licenses/>.

//! # The HTTP gateway
//!
//! A thin translator between the public HTTP+cookie surface & the authenticated gRPC calls
//! beneath it. It owns no business state-- just session management, request validation & error
//! translation.
//!
//! On that last point: RPC status codes map onto HTTP codes per a fixed table, and the gateway
//! *never* forwards internal error strings from its dependencies. Every failure a client sees
//! carries one of a small set of canonical messages.

use std::sync::Arc;

use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use snafu::{prelude::*, Backtrace};
use tower_http::{set_header::SetResponseHeaderLayer, trace::TraceLayer};
use tracing::error;

use wandersphere_shared::api::ErrorResponse;

use crate::{
    cache::Backend as CacheBackend,
    client::{self, AuthPostApi, NewsfeedApi},
    metrics::Instruments,
    session::SessionConfig,
};

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        gateway state                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Application state available to all gateway handlers
pub struct Gateway {
    pub authpost: Arc<dyn AuthPostApi + Send + Sync>,
    pub newsfeed: Arc<dyn NewsfeedApi + Send + Sync>,
    pub cache: Arc<dyn CacheBackend + Send + Sync>,
    pub session: SessionConfig,
    pub instruments: Arc<Instruments>,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The error type shared by every gateway handler
///
/// The variants are the abstract failure kinds of the API; `as_status_and_msg` pins each to an
/// HTTP status & a canonical user-facing message. Note that `NotAllowed` (a non-author editing or
/// deleting a post) maps to 401, not 403-- that's the compatibility contract with existing
/// clients, odd as it reads.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("{message}"))]
    Validation { message: String },
    #[snafu(display("Unauthorized"))]
    Unauthorized { backtrace: Backtrace },
    #[snafu(display("{what} not found"))]
    NotFound { what: &'static str },
    #[snafu(display("{message}"))]
    Conflict { message: String },
    #[snafu(display("Not allowed"))]
    NotAllowed { backtrace: Backtrace },
    #[snafu(display("RPC failure: {source}"))]
    Rpc {
        source: client::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Session failure: {source}"))]
    Session {
        source: crate::session::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn validation(message: impl Into<String>) -> Error {
        Error::Validation {
            message: message.into(),
        }
    }
    pub fn conflict(message: impl Into<String>) -> Error {
        Error::Conflict {
            message: message.into(),
        }
    }
    pub fn as_status_and_msg(&self) -> (StatusCode, &'static str, String) {
        match self {
            Error::Validation { message } => {
                (StatusCode::BAD_REQUEST, "validation_error", message.clone())
            }
            Error::Unauthorized { .. } => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "Session is invalid or expired".to_owned(),
            ),
            Error::NotFound { what } => (
                StatusCode::BAD_REQUEST,
                "not_found",
                format!("{} not found", what),
            ),
            Error::Conflict { message } => {
                (StatusCode::BAD_REQUEST, "conflict", message.clone())
            }
            // 401 per the compatibility table; see the type-level comment
            Error::NotAllowed { .. } => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "not allowed".to_owned(),
            ),
            // Never surface dependency internals to the client
            Error::Rpc { source, .. } => {
                error!("gateway RPC failure: {}", source);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal error".to_owned(),
                )
            }
            Error::Session { source, .. } => {
                error!("gateway session failure: {}", source);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal error".to_owned(),
                )
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let (code, error, message) = self.as_status_and_msg();
        (
            code,
            Json(ErrorResponse {
                error: error.to_owned(),
                message,
                code: code.as_u16(),
            }),
        )
            .into_response()
    }
}

/// Pull the authenticated user out of the request extensions, or 401
///
/// The session middleware stashes an [AuthedUser](crate::session::AuthedUser) for requests that
/// carried a live session; endpoints that require one funnel through here.
pub fn require_session(
    user: StdResult<
        axum::Extension<crate::session::AuthedUser>,
        axum::extract::rejection::ExtensionRejection,
    >,
) -> Result<crate::session::AuthedUser> {
    user.map(|axum::Extension(user)| user)
        .map_err(|_| UnauthorizedSnafu.build())
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           the router                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn healthcheck() -> &'static str {
    "GOOD"
}

/// Assemble the gateway's public router
pub fn make_router(state: Arc<Gateway>) -> Router {
    Router::new()
        .route("/healthcheck", get(healthcheck))
        .nest("/api/v1", crate::users_api::make_router(state.clone()))
        .nest("/api/v1", crate::friends_api::make_router(state.clone()))
        .nest("/api/v1", crate::posts_api::make_router(state.clone()))
        .nest("/api/v1", crate::newsfeed_api::make_router(state.clone()))
        // Session resolution & sliding refresh applies to everything
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            crate::session::middleware,
        ))
        .layer(TraceLayer::new_for_http())
        // All responses are JSON; add the appropriate Content-Type header (but leave the existing
        // header should a handler set it specially)
        .layer(SetResponseHeaderLayer::if_not_present(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        ))
        .with_state(state)
}

/// `healthcheck`-only router for the sidecar health port every daemon runs
pub fn make_health_router() -> Router {
    Router::new().route("/healthcheck", get(healthcheck))
}
