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

//! # postgres
//!
//! [Backend] implementation for PostgreSQL.
//!
//! [Backend]: crate::storage::Backend
//!
//! Identifiers are `bigserial` columns, so ids are 64-bit & monotonically increasing. Image paths
//! are stored as a single space-separated string (`content_image_path text`)-- this encoding is
//! load-bearing for existing rows & clients, so it's joined/split at this boundary & nowhere else.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use snafu::{prelude::*, Backtrace};
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::{
    entities::{
        join_image_paths, split_image_paths, Comment, CommentId, PasswordHash, Post, PostId, User,
        UserEmail, UserId, Username,
    },
    storage::{self, NewPost, NewUser, PostUpdate, UserUpdate},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to connect to PostgreSQL: {source}"))]
    Connect {
        source: sqlx::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Schema setup failed: {source}"))]
    Schema {
        source: sqlx::Error,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

type StorageResult<T> = std::result::Result<T, storage::Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                wandersphere PostgreSQL Store type                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// `wandersphere`-specific PostgreSQL handle
///
/// Instantiate via [Store::new] with a DSN & pool limits; all connections are pooled & the
/// post-deletion cascade runs in an explicit transaction.
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub async fn new(
        dsn: &str,
        max_connections: u32,
        idle_timeout: Duration,
        max_lifetime: Duration,
    ) -> Result<Store> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .idle_timeout(idle_timeout)
            .max_lifetime(max_lifetime)
            .connect(dsn)
            .await
            .context(ConnectSnafu)?;
        Ok(Store { pool })
    }

    /// Bring the schema up, if it isn't already
    ///
    /// Proper migration tooling is an operational concern outside this service; this just makes a
    /// fresh development database usable.
    pub async fn ensure_schema(&self) -> Result<()> {
        for stmt in [
            r#"create table if not exists users (
                 id bigserial primary key,
                 user_name text not null unique,
                 email text not null unique,
                 first_name text not null default '',
                 last_name text not null default '',
                 date_of_birth date not null,
                 salt bytea not null,
                 hashed_password text not null
               )"#,
            r#"create table if not exists posts (
                 id bigserial primary key,
                 user_id bigint not null references users (id),
                 content_text text not null default '',
                 content_image_path text not null default '',
                 created_at timestamptz not null default now(),
                 deleted_at timestamptz
               )"#,
            r#"create table if not exists comments (
                 id bigserial primary key,
                 post_id bigint not null references posts (id),
                 user_id bigint not null references users (id),
                 content_text text not null default '',
                 created_at timestamptz not null default now()
               )"#,
            r#"create table if not exists likes (
                 post_id bigint not null references posts (id),
                 user_id bigint not null references users (id),
                 primary key (post_id, user_id)
               )"#,
            r#"create table if not exists follows (
                 follower_id bigint not null references users (id),
                 followee_id bigint not null references users (id),
                 primary key (follower_id, followee_id)
               )"#,
        ] {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .context(SchemaSnafu)?;
        }
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              rows                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(sqlx::FromRow)]
struct UserRow {
    id: i64,
    user_name: String,
    email: String,
    first_name: String,
    last_name: String,
    date_of_birth: NaiveDate,
    salt: Vec<u8>,
    hashed_password: String,
}

impl TryFrom<UserRow> for User {
    type Error = storage::Error;

    fn try_from(row: UserRow) -> StorageResult<User> {
        Ok(User {
            id: UserId::new(row.id),
            username: Username::new(&row.user_name).map_err(storage::Error::new)?,
            email: UserEmail::new(&row.email).map_err(storage::Error::new)?,
            first_name: row.first_name,
            last_name: row.last_name,
            date_of_birth: row.date_of_birth,
            password: PasswordHash::from_parts(row.salt, row.hashed_password),
        })
    }
}

#[derive(sqlx::FromRow)]
struct PostRow {
    id: i64,
    user_id: i64,
    content_text: String,
    content_image_path: String,
    created_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl From<PostRow> for Post {
    fn from(row: PostRow) -> Post {
        Post {
            id: PostId::new(row.id),
            user_id: UserId::new(row.user_id),
            content_text: row.content_text,
            content_image_path: split_image_paths(&row.content_image_path),
            created_at: row.created_at,
            deleted_at: row.deleted_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct CommentRow {
    id: i64,
    post_id: i64,
    user_id: i64,
    content_text: String,
    created_at: DateTime<Utc>,
}

impl From<CommentRow> for Comment {
    fn from(row: CommentRow) -> Comment {
        Comment {
            id: CommentId::new(row.id),
            post_id: PostId::new(row.post_id),
            user_id: UserId::new(row.user_id),
            content_text: row.content_text,
            created_at: row.created_at,
        }
    }
}

// Translate a unique-constraint violation on `users` into the typed conflict the service layer
// reports back to callers; anything else stays opaque.
fn map_user_insert_err(err: sqlx::Error, user: &NewUser) -> storage::Error {
    if let sqlx::Error::Database(ref db_err) = err {
        if db_err.code().as_deref() == Some("23505") {
            let constraint = db_err.constraint().unwrap_or_default();
            if constraint.contains("user_name") {
                return storage::Error::UsernameClaimed {
                    username: user.username.clone(),
                };
            } else if constraint.contains("email") {
                return storage::Error::EmailClaimed {
                    email: user.email.clone(),
                };
            }
        }
    }
    storage::Error::new(err)
}

#[async_trait]
impl storage::Backend for Store {
    async fn add_user(&self, user: &NewUser) -> StorageResult<UserId> {
        let hash = PasswordHash::new(&user.password).map_err(storage::Error::new)?;
        let (id,): (i64,) = sqlx::query_as(
            r#"insert into users (user_name, email, first_name, last_name, date_of_birth, salt, hashed_password)
               values ($1, $2, $3, $4, $5, $6, $7)
               returning id"#,
        )
        .bind(user.username.as_ref())
        .bind(user.email.as_ref())
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(user.date_of_birth)
        .bind(hash.salt())
        .bind(hash.hashed())
        .fetch_one(&self.pool)
        .await
        .map_err(|err| map_user_insert_err(err, user))?;
        Ok(UserId::new(id))
    }

    async fn user_for_name(&self, name: &str) -> StorageResult<Option<User>> {
        sqlx::query_as::<_, UserRow>("select * from users where user_name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage::Error::new)?
            .map(User::try_from)
            .transpose()
    }

    async fn user_by_id(&self, id: UserId) -> StorageResult<Option<User>> {
        sqlx::query_as::<_, UserRow>("select * from users where id = $1")
            .bind(id.as_i64())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage::Error::new)?
            .map(User::try_from)
            .transpose()
    }

    async fn update_user(&self, id: UserId, update: &UserUpdate) -> StorageResult<bool> {
        let mut tx = self.pool.begin().await.map_err(storage::Error::new)?;
        let (exists,): (bool,) =
            sqlx::query_as("select exists (select 1 from users where id = $1)")
                .bind(id.as_i64())
                .fetch_one(&mut *tx)
                .await
                .map_err(storage::Error::new)?;
        if !exists {
            return Ok(false);
        }
        if let Some(ref password) = update.password {
            // A password change regenerates the salt
            let hash = PasswordHash::new(password).map_err(storage::Error::new)?;
            sqlx::query("update users set hashed_password = $1, salt = $2 where id = $3")
                .bind(hash.hashed())
                .bind(hash.salt())
                .bind(id.as_i64())
                .execute(&mut *tx)
                .await
                .map_err(storage::Error::new)?;
        }
        if let Some(ref first_name) = update.first_name {
            sqlx::query("update users set first_name = $1 where id = $2")
                .bind(first_name)
                .bind(id.as_i64())
                .execute(&mut *tx)
                .await
                .map_err(storage::Error::new)?;
        }
        if let Some(ref last_name) = update.last_name {
            sqlx::query("update users set last_name = $1 where id = $2")
                .bind(last_name)
                .bind(id.as_i64())
                .execute(&mut *tx)
                .await
                .map_err(storage::Error::new)?;
        }
        if let Some(date_of_birth) = update.date_of_birth {
            sqlx::query("update users set date_of_birth = $1 where id = $2")
                .bind(date_of_birth)
                .bind(id.as_i64())
                .execute(&mut *tx)
                .await
                .map_err(storage::Error::new)?;
        }
        tx.commit().await.map_err(storage::Error::new)?;
        Ok(true)
    }

    async fn add_follow(&self, follower: UserId, followee: UserId) -> StorageResult<bool> {
        let result = sqlx::query(
            "insert into follows (follower_id, followee_id) values ($1, $2) on conflict do nothing",
        )
        .bind(follower.as_i64())
        .bind(followee.as_i64())
        .execute(&self.pool)
        .await
        .map_err(storage::Error::new)?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_follow(&self, follower: UserId, followee: UserId) -> StorageResult<bool> {
        let result =
            sqlx::query("delete from follows where follower_id = $1 and followee_id = $2")
                .bind(follower.as_i64())
                .bind(followee.as_i64())
                .execute(&self.pool)
                .await
                .map_err(storage::Error::new)?;
        Ok(result.rows_affected() > 0)
    }

    async fn followers_of(&self, id: UserId) -> StorageResult<Vec<UserId>> {
        let rows: Vec<(i64,)> =
            sqlx::query_as("select follower_id from follows where followee_id = $1")
                .bind(id.as_i64())
                .fetch_all(&self.pool)
                .await
                .map_err(storage::Error::new)?;
        Ok(rows.into_iter().map(|(id,)| UserId::new(id)).collect())
    }

    async fn followings_of(&self, id: UserId) -> StorageResult<Vec<UserId>> {
        let rows: Vec<(i64,)> =
            sqlx::query_as("select followee_id from follows where follower_id = $1")
                .bind(id.as_i64())
                .fetch_all(&self.pool)
                .await
                .map_err(storage::Error::new)?;
        Ok(rows.into_iter().map(|(id,)| UserId::new(id)).collect())
    }

    async fn posts_of(&self, id: UserId) -> StorageResult<Vec<PostId>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "select id from posts where user_id = $1 order by created_at desc, id desc",
        )
        .bind(id.as_i64())
        .fetch_all(&self.pool)
        .await
        .map_err(storage::Error::new)?;
        Ok(rows.into_iter().map(|(id,)| PostId::new(id)).collect())
    }

    async fn add_post(&self, post: &NewPost) -> StorageResult<PostId> {
        let (id,): (i64,) = sqlx::query_as(
            r#"insert into posts (user_id, content_text, content_image_path, deleted_at)
               values ($1, $2, $3, case when $4 then null else now() end)
               returning id"#,
        )
        .bind(post.user_id.as_i64())
        .bind(&post.content_text)
        .bind(join_image_paths(&post.content_image_path))
        .bind(post.visible)
        .fetch_one(&self.pool)
        .await
        .map_err(storage::Error::new)?;
        Ok(PostId::new(id))
    }

    async fn post_by_id(&self, id: PostId) -> StorageResult<Option<Post>> {
        Ok(sqlx::query_as::<_, PostRow>("select * from posts where id = $1")
            .bind(id.as_i64())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage::Error::new)?
            .map(Post::from))
    }

    async fn update_post(&self, id: PostId, update: &PostUpdate) -> StorageResult<()> {
        let mut tx = self.pool.begin().await.map_err(storage::Error::new)?;
        if let Some(ref text) = update.content_text {
            sqlx::query("update posts set content_text = $1 where id = $2")
                .bind(text)
                .bind(id.as_i64())
                .execute(&mut *tx)
                .await
                .map_err(storage::Error::new)?;
        }
        if let Some(ref paths) = update.content_image_path {
            sqlx::query("update posts set content_image_path = $1 where id = $2")
                .bind(join_image_paths(paths))
                .bind(id.as_i64())
                .execute(&mut *tx)
                .await
                .map_err(storage::Error::new)?;
        }
        if let Some(visible) = update.visible {
            sqlx::query(
                "update posts set deleted_at = case when $1 then null else now() end where id = $2",
            )
            .bind(visible)
            .bind(id.as_i64())
            .execute(&mut *tx)
            .await
            .map_err(storage::Error::new)?;
        }
        tx.commit().await.map_err(storage::Error::new)
    }

    async fn delete_post_cascade(&self, id: PostId) -> StorageResult<()> {
        // Dependents first, post last, all-or-nothing.
        let mut tx = self.pool.begin().await.map_err(storage::Error::new)?;
        sqlx::query("delete from comments where post_id = $1")
            .bind(id.as_i64())
            .execute(&mut *tx)
            .await
            .map_err(storage::Error::new)?;
        sqlx::query("delete from likes where post_id = $1")
            .bind(id.as_i64())
            .execute(&mut *tx)
            .await
            .map_err(storage::Error::new)?;
        sqlx::query("delete from posts where id = $1")
            .bind(id.as_i64())
            .execute(&mut *tx)
            .await
            .map_err(storage::Error::new)?;
        tx.commit().await.map_err(storage::Error::new)
    }

    async fn add_comment(
        &self,
        post: PostId,
        user: UserId,
        text: &str,
    ) -> StorageResult<CommentId> {
        let (id,): (i64,) = sqlx::query_as(
            "insert into comments (post_id, user_id, content_text) values ($1, $2, $3) returning id",
        )
        .bind(post.as_i64())
        .bind(user.as_i64())
        .bind(text)
        .fetch_one(&self.pool)
        .await
        .map_err(storage::Error::new)?;
        Ok(CommentId::new(id))
    }

    async fn comments_for(&self, post: PostId) -> StorageResult<Vec<Comment>> {
        Ok(sqlx::query_as::<_, CommentRow>(
            "select * from comments where post_id = $1 order by created_at asc, id asc",
        )
        .bind(post.as_i64())
        .fetch_all(&self.pool)
        .await
        .map_err(storage::Error::new)?
        .into_iter()
        .map(Comment::from)
        .collect())
    }

    async fn add_like(&self, post: PostId, user: UserId) -> StorageResult<()> {
        sqlx::query(
            "insert into likes (post_id, user_id) values ($1, $2) on conflict do nothing",
        )
        .bind(post.as_i64())
        .bind(user.as_i64())
        .execute(&self.pool)
        .await
        .map_err(storage::Error::new)?;
        Ok(())
    }

    async fn likers_of(&self, post: PostId) -> StorageResult<Vec<UserId>> {
        let rows: Vec<(i64,)> =
            sqlx::query_as("select user_id from likes where post_id = $1 order by user_id asc")
                .bind(post.as_i64())
                .fetch_all(&self.pool)
                .await
                .map_err(storage::Error::new)?;
        Ok(rows.into_iter().map(|(id,)| UserId::new(id)).collect())
    }
}
