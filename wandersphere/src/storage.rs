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

//! # storage
//!
//! Abstractions for the authoring service's storage layer.
//!
//! The relational store behind the authoring service is deliberately opaque to the rest of the
//! system: application code writes to this trait, and a particular implementation (see
//! [postgres](crate::postgres)) is chosen at startup.

use async_trait::async_trait;
use chrono::NaiveDate;
use snafu::{Backtrace, Snafu};

use crate::entities::{
    Comment, CommentId, Password, Post, PostId, User, UserEmail, UserId, Username,
};

#[derive(Debug, Snafu)]
pub enum Error {
    // Generic error variant implementations can use for anything the caller can't act on
    #[snafu(display("{source}"))]
    Backend {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
        backtrace: Backtrace,
    },
    #[snafu(display("Username {username} is already claimed"))]
    UsernameClaimed { username: Username },
    #[snafu(display("E-mail {email} is already registered"))]
    EmailClaimed { email: UserEmail },
}

impl Error {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::Backend {
            source: Box::new(err),
            backtrace: Backtrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A user as yet unwritten; the backend assigns the id
#[derive(Clone, Debug)]
pub struct NewUser {
    pub username: Username,
    pub email: UserEmail,
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: NaiveDate,
    pub password: Password,
}

/// Fields to change on an existing user; `None` means "leave it be"
///
/// A password change regenerates the salt as a side-effect.
#[derive(Clone, Debug, Default)]
pub struct UserUpdate {
    pub password: Option<Password>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
}

#[derive(Clone, Debug)]
pub struct NewPost {
    pub user_id: UserId,
    pub content_text: String,
    pub content_image_path: Vec<String>,
    pub visible: bool,
}

/// Fields to change on an existing post; `None` means "leave it be"
#[derive(Clone, Debug, Default)]
pub struct PostUpdate {
    pub content_text: Option<String>,
    pub content_image_path: Option<Vec<String>>,
    pub visible: Option<bool>,
}

/// Object-safe trait abstracting over the authoring service's datastore
///
/// Uniqueness rules live down here, next to the store that can actually enforce them:
/// `add_user` fails typed on a claimed username or e-mail, `add_follow`/`add_like` are
/// idempotent, and `delete_post_cascade` removes a post's comments & likes in the same
/// transaction as the post itself, rolling back wholesale on any sub-step failure.
#[async_trait]
pub trait Backend {
    async fn add_user(&self, user: &NewUser) -> Result<UserId>;
    /// Retrieve a [User] given a textual username. None means there is no user by that name.
    async fn user_for_name(&self, name: &str) -> Result<Option<User>>;
    async fn user_by_id(&self, id: UserId) -> Result<Option<User>>;
    /// Apply `update`; return false if there is no such user
    async fn update_user(&self, id: UserId, update: &UserUpdate) -> Result<bool>;
    /// Record `follower` following `followee`; return false if the edge already existed
    async fn add_follow(&self, follower: UserId, followee: UserId) -> Result<bool>;
    /// Remove the edge; return false if it wasn't there
    async fn remove_follow(&self, follower: UserId, followee: UserId) -> Result<bool>;
    async fn followers_of(&self, id: UserId) -> Result<Vec<UserId>>;
    async fn followings_of(&self, id: UserId) -> Result<Vec<UserId>>;
    /// Post ids for `id`, ordered by creation time, newest first
    async fn posts_of(&self, id: UserId) -> Result<Vec<PostId>>;
    async fn add_post(&self, post: &NewPost) -> Result<PostId>;
    /// Unscoped: hidden posts are returned too (their `deleted_at` is set)
    async fn post_by_id(&self, id: PostId) -> Result<Option<Post>>;
    async fn update_post(&self, id: PostId, update: &PostUpdate) -> Result<()>;
    /// Remove the post, its comments & its likes in one transaction
    async fn delete_post_cascade(&self, id: PostId) -> Result<()>;
    async fn add_comment(&self, post: PostId, user: UserId, text: &str) -> Result<CommentId>;
    async fn comments_for(&self, post: PostId) -> Result<Vec<Comment>>;
    /// Idempotent: re-liking is a no-op
    async fn add_like(&self, post: PostId, user: UserId) -> Result<()>;
    async fn likers_of(&self, post: PostId) -> Result<Vec<UserId>>;
}
