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

//! # The wandersphere HTTP API, as types
//!
//! Request & response bodies for the `/api/v1` surface served by the gateway. These are used on
//! both sides of the wire: the gateway serializes them, and the test client (and any future Rust
//! client) deserializes them.
//!
//! A note on errors: every non-2xx response carries an [ErrorResponse]. The gateway never forwards
//! internal error strings from its dependencies; the `message` field always holds one of a small
//! set of canonical, user-facing strings ("user not found", "post not found", &c).

use serde::{Deserialize, Serialize};

/// Body of every non-2xx response from the gateway
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

/// Body of assorted "it worked" responses that have nothing else to say
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             users                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CreateUserRequest {
    pub user_name: String,
    pub password: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    /// YYYY-MM-DD
    pub date_of_birth: String,
    pub email: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LoginRequest {
    pub user_name: String,
    pub password: String,
}

/// The non-secret portion of a user's profile
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct UserDetailInfo {
    pub user_id: i64,
    pub user_name: String,
    pub first_name: String,
    pub last_name: String,
    /// YYYY-MM-DD
    pub date_of_birth: String,
    pub email: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LoginResponse {
    pub message: String,
    pub user: UserDetailInfo,
}

/// Every field here is optional; only those present are applied.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct EditUserRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    /// YYYY-MM-DD
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_of_birth: Option<String>,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         follow graph                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct UserFollowerResponse {
    pub followers_ids: Vec<i64>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct UserFollowingResponse {
    pub followings_ids: Vec<i64>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct UserPostsResponse {
    pub posts_ids: Vec<i64>,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             posts                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CreatePostRequest {
    pub content_text: String,
    /// Image URLs; `https?://…` or `/api/v1/binaries/…`
    #[serde(default)]
    pub content_image_path: Vec<String>,
    /// Defaults to true; false creates the post hidden
    #[serde(default)]
    pub visible: Option<bool>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CreatePostResponse {
    pub post_id: i64,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct EditPostRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_image_path: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visible: Option<bool>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CommentPostRequest {
    pub content_text: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CommentPostResponse {
    pub comment_id: i64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CommentInfo {
    pub comment_id: i64,
    pub post_id: i64,
    pub user_id: i64,
    pub content_text: String,
    /// Unix seconds
    pub created_at: i64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PostDetailResponse {
    pub post_id: i64,
    pub user_id: i64,
    pub content_text: String,
    pub content_image_path: Vec<String>,
    /// Unix seconds
    pub created_at: i64,
    pub comments: Vec<CommentInfo>,
    pub users_liked: Vec<i64>,
}

/// Response to `GET /posts/url`
///
/// In production this would be a presigned blob-store upload URL; blob storage is an external
/// collaborator, so in development the gateway vends a deterministic placeholder.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct UploadUrlResponse {
    pub url: String,
    /// Unix seconds at which the URL stops working
    pub expires_at: i64,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            newsfeed                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NewsfeedResponse {
    pub posts_ids: Vec<i64>,
    pub current_page: u32,
    pub total_pages: u32,
    pub total_items: u64,
}

#[cfg(test)]
mod test {
    use super::*;

    // The edit-user body is sparse on the wire; absent fields must round-trip as None, not
    // empty strings.
    #[test]
    fn edit_user_partial_roundtrip() {
        let req: EditUserRequest = serde_json::from_str(r#"{"first_name":"Alice"}"#).unwrap();
        assert_eq!(req.first_name.as_deref(), Some("Alice"));
        assert!(req.password.is_none());
        assert!(req.date_of_birth.is_none());
        let text = serde_json::to_string(&req).unwrap();
        assert_eq!(text, r#"{"first_name":"Alice"}"#);
    }

    #[test]
    fn create_post_defaults() {
        let req: CreatePostRequest = serde_json::from_str(r#"{"content_text":"hi"}"#).unwrap();
        assert!(req.content_image_path.is_empty());
        assert!(req.visible.is_none());
    }
}
