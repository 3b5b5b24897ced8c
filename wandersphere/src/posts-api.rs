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

//! # Posts API
//!
//! The post lifecycle: create, read, edit, delete, comment & like-- plus the presigned-upload-URL
//! endpoint (a development placeholder; blob storage is an external collaborator).

use std::sync::Arc;

use axum::{
    extract::{rejection::ExtensionRejection, Path, Query, State},
    routing::{get, post},
    Extension, Json, Router,
};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use snafu::ResultExt;
use uuid::Uuid;

use wandersphere_shared::api::{
    CommentInfo, CommentPostRequest, CommentPostResponse, CreatePostRequest, CreatePostResponse,
    EditPostRequest, MessageResponse, PostDetailResponse, UploadUrlResponse,
};

use crate::{
    gateway::{require_session, Error, Gateway, NotAllowedSnafu, Result, RpcSnafu},
    rpc::protobuf,
    session::AuthedUser,
};

type StdResult<T, E> = std::result::Result<T, E>;

lazy_static! {
    // Image URLs: plain http(s), or the relative form our own binaries endpoint vends
    static ref IMAGE_URL: Regex = Regex::new(r"^(https?://\S+|/api/v1/binaries/\S+)$").unwrap();
}

fn validate_image_paths(paths: &[String]) -> Result<()> {
    match paths.iter().find(|path| !IMAGE_URL.is_match(path)) {
        Some(bad) => Err(Error::validation(format!("{} is not a valid image URL", bad))),
        None => Ok(()),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        `POST /posts`                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn create(
    State(state): State<Arc<Gateway>>,
    user: StdResult<Extension<AuthedUser>, ExtensionRejection>,
    Json(req): Json<CreatePostRequest>,
) -> Result<Json<CreatePostResponse>> {
    let caller = require_session(user)?;
    validate_image_paths(&req.content_image_path)?;

    use protobuf::create_post_response::Status as RespStatus;
    let rsp = state
        .authpost
        .create_post(protobuf::CreatePostRequest {
            user_id: caller.user_id.as_i64(),
            content_text: req.content_text,
            content_image_path: req.content_image_path,
            visible: req.visible.unwrap_or(true),
        })
        .await
        .context(RpcSnafu)?;
    match rsp.status() {
        RespStatus::Ok => Ok(Json(CreatePostResponse {
            post_id: rsp.post_id,
        })),
        RespStatus::UserNotFound => Err(Error::NotFound { what: "user" }),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                     `GET /posts/{post_id}`                                     //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn detail(
    State(state): State<Arc<Gateway>>,
    Path(post_id): Path<i64>,
) -> Result<Json<PostDetailResponse>> {
    use protobuf::get_post_detail_info_response::Status as RespStatus;
    let rsp = state
        .authpost
        .get_post_detail_info(protobuf::GetPostDetailInfoRequest { post_id })
        .await
        .context(RpcSnafu)?;
    match (rsp.status(), rsp.post) {
        (RespStatus::Ok, Some(post)) => Ok(Json(PostDetailResponse {
            post_id: post.post_id,
            user_id: post.user_id,
            content_text: post.content_text,
            content_image_path: post.content_image_path,
            created_at: post.created_at,
            comments: post
                .comments
                .into_iter()
                .map(|c| CommentInfo {
                    comment_id: c.comment_id,
                    post_id: c.post_id,
                    user_id: c.user_id,
                    content_text: c.content_text,
                    created_at: c.created_at,
                })
                .collect(),
            users_liked: post.users_liked,
        })),
        _ => Err(Error::NotFound { what: "post" }),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                     `PUT /posts/{post_id}`                                     //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn edit(
    State(state): State<Arc<Gateway>>,
    user: StdResult<Extension<AuthedUser>, ExtensionRejection>,
    Path(post_id): Path<i64>,
    Json(req): Json<EditPostRequest>,
) -> Result<Json<MessageResponse>> {
    let caller = require_session(user)?;
    if let Some(ref paths) = req.content_image_path {
        validate_image_paths(paths)?;
    }

    use protobuf::edit_post_response::Status as RespStatus;
    let rsp = state
        .authpost
        .edit_post(protobuf::EditPostRequest {
            user_id: caller.user_id.as_i64(),
            post_id,
            content_text: req.content_text,
            content_image_path: req
                .content_image_path
                .map(|paths| protobuf::ImagePaths { paths }),
            visible: req.visible,
        })
        .await
        .context(RpcSnafu)?;
    match rsp.status() {
        RespStatus::Ok => Ok(Json(MessageResponse {
            message: "OK".to_owned(),
        })),
        RespStatus::UserNotFound => Err(Error::NotFound { what: "user" }),
        RespStatus::PostNotFound => Err(Error::NotFound { what: "post" }),
        RespStatus::NotAllowed => NotAllowedSnafu.fail(),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                   `DELETE /posts/{post_id}`                                    //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn delete(
    State(state): State<Arc<Gateway>>,
    user: StdResult<Extension<AuthedUser>, ExtensionRejection>,
    Path(post_id): Path<i64>,
) -> Result<Json<MessageResponse>> {
    let caller = require_session(user)?;

    use protobuf::delete_post_response::Status as RespStatus;
    let rsp = state
        .authpost
        .delete_post(protobuf::DeletePostRequest {
            user_id: caller.user_id.as_i64(),
            post_id,
        })
        .await
        .context(RpcSnafu)?;
    match rsp.status() {
        RespStatus::Ok => Ok(Json(MessageResponse {
            message: "OK".to_owned(),
        })),
        RespStatus::UserNotFound => Err(Error::NotFound { what: "user" }),
        RespStatus::PostNotFound => Err(Error::NotFound { what: "post" }),
        RespStatus::NotAllowed => NotAllowedSnafu.fail(),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                    `POST /posts/{post_id}`                                     //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn comment(
    State(state): State<Arc<Gateway>>,
    user: StdResult<Extension<AuthedUser>, ExtensionRejection>,
    Path(post_id): Path<i64>,
    Json(req): Json<CommentPostRequest>,
) -> Result<Json<CommentPostResponse>> {
    let caller = require_session(user)?;
    if req.content_text.is_empty() {
        return Err(Error::validation("a comment may not be empty"));
    }

    use protobuf::comment_post_response::Status as RespStatus;
    let rsp = state
        .authpost
        .comment_post(protobuf::CommentPostRequest {
            user_id: caller.user_id.as_i64(),
            post_id,
            content_text: req.content_text,
        })
        .await
        .context(RpcSnafu)?;
    match rsp.status() {
        RespStatus::Ok => Ok(Json(CommentPostResponse {
            comment_id: rsp.comment_id,
        })),
        RespStatus::UserNotFound => Err(Error::NotFound { what: "user" }),
        RespStatus::PostNotFound => Err(Error::NotFound { what: "post" }),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                 `POST /posts/{post_id}/likes`                                  //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn like(
    State(state): State<Arc<Gateway>>,
    user: StdResult<Extension<AuthedUser>, ExtensionRejection>,
    Path(post_id): Path<i64>,
) -> Result<Json<MessageResponse>> {
    let caller = require_session(user)?;

    use protobuf::like_post_response::Status as RespStatus;
    let rsp = state
        .authpost
        .like_post(protobuf::LikePostRequest {
            user_id: caller.user_id.as_i64(),
            post_id,
        })
        .await
        .context(RpcSnafu)?;
    match rsp.status() {
        RespStatus::Ok => Ok(Json(MessageResponse {
            message: "OK".to_owned(),
        })),
        RespStatus::UserNotFound => Err(Error::NotFound { what: "user" }),
        RespStatus::PostNotFound => Err(Error::NotFound { what: "post" }),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        `GET /posts/url`                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Deserialize)]
struct UploadUrlParams {
    file_name: Option<String>,
}

/// How long the (placeholder) upload URL claims to be good for
const UPLOAD_URL_LIFETIME_SECS: i64 = 15 * 60;

/// Vend an upload URL
///
/// In production this would mint a presigned blob-store URL; in development we hand back a
/// deterministic placeholder so clients can exercise their upload flow end to end.
async fn upload_url(
    user: StdResult<Extension<AuthedUser>, ExtensionRejection>,
    Query(params): Query<UploadUrlParams>,
) -> Result<Json<UploadUrlResponse>> {
    let _ = require_session(user)?;
    let file_name = params.file_name.unwrap_or_else(|| "upload".to_owned());
    Ok(Json(UploadUrlResponse {
        url: format!(
            "https://storage.wandersphere.dev/binaries/{}-{}",
            Uuid::new_v4(),
            file_name
        ),
        expires_at: chrono::Utc::now().timestamp() + UPLOAD_URL_LIFETIME_SECS,
    }))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Public API                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Return a router for the Posts API; merged with its siblings under `/api/v1`
pub fn make_router(state: Arc<Gateway>) -> Router<Arc<Gateway>> {
    Router::new()
        .route("/posts", post(create))
        // The static `/posts/url` route wins over the `{post_id}` capture
        .route("/posts/url", get(upload_url))
        .route("/posts/{post_id}", get(detail).put(edit).delete(delete).post(comment))
        .route("/posts/{post_id}/likes", post(like))
        .with_state(state)
}
