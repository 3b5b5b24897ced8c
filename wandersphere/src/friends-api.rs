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

//! # Friends API
//!
//! The follow graph: who follows whom, and a user's posts.
//!
//! The follower/following/posts reads are public; following & unfollowing require a session, and
//! the target of those is always the `{user_id}` in the path (the follower is the caller).

use std::sync::Arc;

use axum::{
    extract::{rejection::ExtensionRejection, Path, State},
    routing::{get, post},
    Extension, Json, Router,
};
use snafu::ResultExt;
use tracing::debug;

use wandersphere_shared::api::{
    MessageResponse, UserFollowerResponse, UserFollowingResponse, UserPostsResponse,
};

use crate::{
    gateway::{require_session, Error, Gateway, Result, RpcSnafu},
    rpc::protobuf,
    session::AuthedUser,
};

type StdResult<T, E> = std::result::Result<T, E>;

async fn followers(
    State(state): State<Arc<Gateway>>,
    Path(user_id): Path<i64>,
) -> Result<Json<UserFollowerResponse>> {
    use protobuf::get_user_follower_response::Status as RespStatus;
    let rsp = state
        .authpost
        .get_user_follower(protobuf::GetUserFollowerRequest { user_id })
        .await
        .context(RpcSnafu)?;
    match rsp.status() {
        RespStatus::Ok => Ok(Json(UserFollowerResponse {
            followers_ids: rsp.followers_ids,
        })),
        RespStatus::UserNotFound => Err(Error::NotFound { what: "user" }),
    }
}

async fn followings(
    State(state): State<Arc<Gateway>>,
    Path(user_id): Path<i64>,
) -> Result<Json<UserFollowingResponse>> {
    use protobuf::get_user_following_response::Status as RespStatus;
    let rsp = state
        .authpost
        .get_user_following(protobuf::GetUserFollowingRequest { user_id })
        .await
        .context(RpcSnafu)?;
    match rsp.status() {
        RespStatus::Ok => Ok(Json(UserFollowingResponse {
            followings_ids: rsp.followings_ids,
        })),
        RespStatus::UserNotFound => Err(Error::NotFound { what: "user" }),
    }
}

async fn posts(
    State(state): State<Arc<Gateway>>,
    Path(user_id): Path<i64>,
) -> Result<Json<UserPostsResponse>> {
    use protobuf::get_user_posts_response::Status as RespStatus;
    let rsp = state
        .authpost
        .get_user_posts(protobuf::GetUserPostsRequest { user_id })
        .await
        .context(RpcSnafu)?;
    match rsp.status() {
        RespStatus::Ok => Ok(Json(UserPostsResponse {
            posts_ids: rsp.posts_ids,
        })),
        RespStatus::UserNotFound => Err(Error::NotFound { what: "user" }),
    }
}

async fn follow(
    State(state): State<Arc<Gateway>>,
    user: StdResult<Extension<AuthedUser>, ExtensionRejection>,
    Path(user_id): Path<i64>,
) -> Result<Json<MessageResponse>> {
    let caller = require_session(user)?;
    debug!("{} requests to follow {}", caller.user_id, user_id);

    use protobuf::follow_user_response::Status as RespStatus;
    let rsp = state
        .authpost
        .follow_user(protobuf::FollowUserRequest {
            user_id: caller.user_id.as_i64(),
            following_id: user_id,
        })
        .await
        .context(RpcSnafu)?;
    match rsp.status() {
        RespStatus::Ok => Ok(Json(MessageResponse {
            message: "OK".to_owned(),
        })),
        RespStatus::UserNotFound => Err(Error::NotFound { what: "user" }),
        // Self-follows land here too; the service reports them as already-followed
        RespStatus::AlreadyFollowed => Err(Error::conflict("already following this user")),
    }
}

async fn unfollow(
    State(state): State<Arc<Gateway>>,
    user: StdResult<Extension<AuthedUser>, ExtensionRejection>,
    Path(user_id): Path<i64>,
) -> Result<Json<MessageResponse>> {
    let caller = require_session(user)?;

    use protobuf::unfollow_user_response::Status as RespStatus;
    let rsp = state
        .authpost
        .unfollow_user(protobuf::UnfollowUserRequest {
            user_id: caller.user_id.as_i64(),
            following_id: user_id,
        })
        .await
        .context(RpcSnafu)?;
    match rsp.status() {
        RespStatus::Ok => Ok(Json(MessageResponse {
            message: "OK".to_owned(),
        })),
        RespStatus::UserNotFound => Err(Error::NotFound { what: "user" }),
        RespStatus::NotFollowed => Err(Error::conflict("not following this user")),
    }
}

/// Return a router for the Friends API; merged with its siblings under `/api/v1`
pub fn make_router(state: Arc<Gateway>) -> Router<Arc<Gateway>> {
    Router::new()
        .route("/friends/{user_id}/followers", get(followers))
        .route("/friends/{user_id}/followings", get(followings))
        .route("/friends/{user_id}/posts", get(posts))
        .route("/friends/{user_id}", post(follow).delete(unfollow))
        .with_state(state)
}
