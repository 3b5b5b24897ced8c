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

//! # User API
//!
//! Sign-up, login/logout & profile editing.

use std::sync::Arc;

use axum::{
    extract::{rejection::ExtensionRejection, Path, State},
    http::{header::SET_COOKIE, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Extension, Json, Router,
};
use snafu::ResultExt;
use tracing::{info, warn};

use wandersphere_shared::api::{
    CreateUserRequest, EditUserRequest, LoginRequest, LoginResponse, MessageResponse,
    UserDetailInfo,
};

use crate::{
    entities::{self, UserId},
    gateway::{require_session, ConflictSnafu, Error, Gateway, Result, RpcSnafu, SessionSnafu},
    metrics::Metric,
    rpc::protobuf,
    session::{self, AuthedUser},
};

type StdResult<T, E> = std::result::Result<T, E>;

// Request validation happens here at the boundary, before any RPC is issued.
fn validate_username(name: &str) -> Result<()> {
    entities::Username::new(name)
        .map(|_| ())
        .map_err(|err| Error::validation(err.to_string()))
}

fn validate_password(password: &str) -> Result<()> {
    entities::Password::new(password.into())
        .map(|_| ())
        .map_err(|err| Error::validation(err.to_string()))
}

fn validate_email(email: &str) -> Result<()> {
    entities::UserEmail::new(email)
        .map(|_| ())
        .map_err(|err| Error::validation(err.to_string()))
}

fn parse_date(text: &str) -> Result<i64> {
    entities::parse_birth_date(text)
        .map(crate::rpc::date_to_unix)
        .map_err(|err| Error::validation(err.to_string()))
}

fn profile_to_api(user: protobuf::UserDetailInfo) -> UserDetailInfo {
    UserDetailInfo {
        user_id: user.user_id,
        user_name: user.user_name,
        first_name: user.first_name,
        last_name: user.last_name,
        date_of_birth: crate::rpc::date_from_unix(user.date_of_birth)
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_default(),
        email: user.email,
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        `/users/signup`                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn signup(
    State(state): State<Arc<Gateway>>,
    Json(req): Json<CreateUserRequest>,
) -> Result<Json<MessageResponse>> {
    validate_username(&req.user_name)?;
    validate_password(&req.password)?;
    validate_email(&req.email)?;
    let date_of_birth = parse_date(&req.date_of_birth)?;

    use protobuf::create_user_response::Status as RespStatus;
    let rsp = state
        .authpost
        .create_user(protobuf::CreateUserRequest {
            user_name: req.user_name.clone(),
            user_password: req.password,
            first_name: req.first_name,
            last_name: req.last_name,
            date_of_birth,
            email: req.email,
        })
        .await
        .context(RpcSnafu)?;
    match rsp.status() {
        RespStatus::Ok => {
            info!("Created user {}", req.user_name);
            state.instruments.count(Metric::Signups, 1, &[]);
            Ok(Json(MessageResponse {
                message: "OK".to_owned(),
            }))
        }
        RespStatus::UsernameExisted => ConflictSnafu {
            message: "username existed".to_owned(),
        }
        .fail(),
        RespStatus::EmailExisted => ConflictSnafu {
            message: "email existed".to_owned(),
        }
        .fail(),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         `/users/login`                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn login(
    State(state): State<Arc<Gateway>>,
    Json(req): Json<LoginRequest>,
) -> Result<axum::response::Response> {
    validate_username(&req.user_name)?;
    validate_password(&req.password)?;

    use protobuf::check_user_authentication_response::Status as RespStatus;
    let rsp = state
        .authpost
        .check_user_authentication(protobuf::CheckUserAuthenticationRequest {
            user_name: req.user_name.clone(),
            user_password: req.password,
        })
        .await
        .context(RpcSnafu)?;
    match rsp.status() {
        RespStatus::Ok => (),
        // Don't reveal which of the two was wrong
        RespStatus::UserNotFound | RespStatus::WrongPassword => {
            warn!("Failed login for {}", req.user_name);
            state.instruments.count(Metric::LoginFailures, 1, &[]);
            return Err(Error::validation("wrong username or password"));
        }
    }
    let user_id = UserId::new(rsp.user_id);

    let session_id = session::mint(state.cache.as_ref(), &state.session, user_id)
        .await
        .context(SessionSnafu)?;
    let cookie = session::build_cookie(&state.session, &session_id);
    state.instruments.count(Metric::Logins, 1, &[]);

    // Include the profile in the response; if that lookup fails the login itself still stands
    use protobuf::get_user_detail_info_response::Status as DetailStatus;
    let body = match state
        .authpost
        .get_user_detail_info(protobuf::GetUserDetailInfoRequest {
            user_id: user_id.as_i64(),
        })
        .await
    {
        Ok(detail) if detail.status() == DetailStatus::Ok && detail.user.is_some() => {
            Json(LoginResponse {
                message: "Login successful".to_owned(),
                user: profile_to_api(detail.user.unwrap(/* checked above */)),
            })
            .into_response()
        }
        _ => Json(MessageResponse {
            message: "Login successful".to_owned(),
        })
        .into_response(),
    };

    let mut response = body;
    if let Ok(value) = axum::http::HeaderValue::from_str(&cookie) {
        response.headers_mut().append(SET_COOKIE, value);
    }
    Ok(response)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        `/users/logout`                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn logout(
    State(state): State<Arc<Gateway>>,
    user: StdResult<Extension<AuthedUser>, ExtensionRejection>,
) -> Result<axum::response::Response> {
    let user = require_session(user)?;
    session::revoke(state.cache.as_ref(), &user.session_id)
        .await
        .context(SessionSnafu)?;

    let mut response = (
        StatusCode::OK,
        Json(MessageResponse {
            message: "OK".to_owned(),
        }),
    )
        .into_response();
    if let Ok(value) = axum::http::HeaderValue::from_str(&session::clear_cookie(&state.session)) {
        response.headers_mut().append(SET_COOKIE, value);
    }
    Ok(response)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         `/users/edit`                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn edit(
    State(state): State<Arc<Gateway>>,
    user: StdResult<Extension<AuthedUser>, ExtensionRejection>,
    Json(req): Json<EditUserRequest>,
) -> Result<Json<MessageResponse>> {
    let user = require_session(user)?;

    if let Some(ref password) = req.password {
        validate_password(password)?;
    }
    let date_of_birth = req.date_of_birth.as_deref().map(parse_date).transpose()?;

    use protobuf::edit_user_response::Status as RespStatus;
    let rsp = state
        .authpost
        .edit_user(protobuf::EditUserRequest {
            user_id: user.user_id.as_i64(),
            user_password: req.password,
            first_name: req.first_name,
            last_name: req.last_name,
            date_of_birth,
        })
        .await
        .context(RpcSnafu)?;
    match rsp.status() {
        RespStatus::Ok => Ok(Json(MessageResponse {
            message: "OK".to_owned(),
        })),
        RespStatus::UserNotFound => Err(Error::NotFound { what: "user" }),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       `/users/{user_id}`                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn profile(
    State(state): State<Arc<Gateway>>,
    Path(user_id): Path<i64>,
) -> Result<Json<UserDetailInfo>> {
    use protobuf::get_user_detail_info_response::Status as RespStatus;
    let rsp = state
        .authpost
        .get_user_detail_info(protobuf::GetUserDetailInfoRequest { user_id })
        .await
        .context(RpcSnafu)?;
    match (rsp.status(), rsp.user) {
        (RespStatus::Ok, Some(user)) => Ok(Json(profile_to_api(user))),
        _ => Err(Error::NotFound { what: "user" }),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Public API                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Return a router for the User API; merged with its siblings under `/api/v1`
pub fn make_router(state: Arc<Gateway>) -> Router<Arc<Gateway>> {
    Router::new()
        .route("/users/signup", post(signup))
        .route("/users/login", post(login))
        .route("/users/logout", post(logout))
        .route("/users/edit", post(edit))
        .route("/users/{user_id}", get(profile))
        .with_state(state)
}
