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

//! # Newsfeed API
//!
//! One endpoint: the caller's personalized, paginated feed.

use std::sync::Arc;

use axum::{
    extract::{rejection::ExtensionRejection, Query, State},
    routing::get,
    Extension, Json, Router,
};
use serde::Deserialize;
use snafu::ResultExt;

use wandersphere_shared::api::NewsfeedResponse;

use crate::{
    gateway::{require_session, Gateway, Result, RpcSnafu},
    rpc::protobuf,
    session::AuthedUser,
};

type StdResult<T, E> = std::result::Result<T, E>;

#[derive(Debug, Deserialize)]
struct NewsfeedParams {
    page: Option<u32>,
    page_size: Option<u32>,
}

/// Serve the caller's feed
///
/// Pagination clamping happens in the newsfeed service (zero means "default"); an empty feed is a
/// perfectly ordinary 200 with no items, not an error.
async fn newsfeed(
    State(state): State<Arc<Gateway>>,
    user: StdResult<Extension<AuthedUser>, ExtensionRejection>,
    Query(params): Query<NewsfeedParams>,
) -> Result<Json<NewsfeedResponse>> {
    let caller = require_session(user)?;

    use protobuf::get_newsfeed_response::Status as RespStatus;
    let rsp = state
        .newsfeed
        .get_newsfeed(protobuf::GetNewsfeedRequest {
            user_id: caller.user_id.as_i64(),
            page: params.page.unwrap_or(0),
            page_size: params.page_size.unwrap_or(0),
        })
        .await
        .context(RpcSnafu)?;
    match rsp.status() {
        RespStatus::Ok => Ok(Json(NewsfeedResponse {
            posts_ids: rsp.posts_ids,
            current_page: rsp.current_page,
            total_pages: rsp.total_pages,
            total_items: rsp.total_items,
        })),
        RespStatus::NewsfeedEmpty => Ok(Json(NewsfeedResponse {
            posts_ids: vec![],
            current_page: 0,
            total_pages: 0,
            total_items: 0,
        })),
    }
}

/// Return a router for the Newsfeed API; merged with its siblings under `/api/v1`
pub fn make_router(state: Arc<Gateway>) -> Router<Arc<Gateway>> {
    Router::new()
        .route("/newsfeed", get(newsfeed))
        .with_state(state)
}
