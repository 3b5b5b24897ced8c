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

//! # The authoring service
//!
//! Source of truth for users, posts, comments, likes & follow edges. Exposes the
//! `AuthenticateAndPost` gRPC surface consumed by the gateway & the fan-out worker.
//!
//! Two conventions worth calling out:
//!
//! 1. Logical failures (not-found, conflicts, authorization) are conveyed by status enums in the
//!    response payload; only genuinely unexpected conditions (the database being down, say)
//!    surface as gRPC transport errors-- those are retryable by the caller.
//!
//! 2. "Async after sync": `CreatePost` returns once the row is committed. The fan-out publish to
//!    the newsfeed publisher happens on a spawned task with a short deadline; its failure is
//!    logged & never fails the author's call. Post deletion notifies the newsfeed reader to sweep
//!    feeds the same way.

use std::{sync::Arc, time::Duration};

use secrecy::SecretString;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, warn};

use crate::{
    client::{NewsfeedApi, PublishApi},
    entities::{Password, PostDetail, PostId, UserId},
    metrics::{Instruments, Metric},
    rpc::{date_from_unix, protobuf},
    storage::{self, Backend as StorageBackend, NewPost, NewUser, PostUpdate, UserUpdate},
};

type StdResult<T, E> = std::result::Result<T, E>;

type RpcResult<T> = StdResult<Response<T>, Status>;

/// Deadline on the fire-and-forget calls spawned off the hot path
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// The authoring service
///
/// `publisher` & `newsfeed` are optional: the service degrades to "no fan-out" / "no sweep"
/// rather than refusing to start when those dependencies aren't configured.
pub struct AuthPostService {
    storage: Arc<dyn StorageBackend + Send + Sync>,
    publisher: Option<Arc<dyn PublishApi + Send + Sync>>,
    newsfeed: Option<Arc<dyn NewsfeedApi + Send + Sync>>,
    instruments: Arc<Instruments>,
}

impl AuthPostService {
    pub fn new(
        storage: Arc<dyn StorageBackend + Send + Sync>,
        publisher: Option<Arc<dyn PublishApi + Send + Sync>>,
        newsfeed: Option<Arc<dyn NewsfeedApi + Send + Sync>>,
        instruments: Arc<Instruments>,
    ) -> AuthPostService {
        AuthPostService {
            storage,
            publisher,
            newsfeed,
            instruments,
        }
    }

    async fn user_exists(&self, id: UserId) -> StdResult<bool, Status> {
        Ok(self
            .storage
            .user_by_id(id)
            .await
            .map_err(storage_to_status)?
            .is_some())
    }
}

// Database errors are transport errors (retryable by the caller), not status-enum results.
fn storage_to_status(err: storage::Error) -> Status {
    error!("storage failure: {}", err);
    Status::internal("storage failure")
}

#[tonic::async_trait]
impl protobuf::authenticate_and_post_server::AuthenticateAndPost for AuthPostService {
    async fn create_user(
        &self,
        request: Request<protobuf::CreateUserRequest>,
    ) -> RpcResult<protobuf::CreateUserResponse> {
        use protobuf::create_user_response::Status as RespStatus;
        let req = request.into_inner();

        let username = crate::entities::Username::new(&req.user_name)
            .map_err(|err| Status::invalid_argument(err.to_string()))?;
        let email = crate::entities::UserEmail::new(&req.email)
            .map_err(|err| Status::invalid_argument(err.to_string()))?;
        let password = Password::new(SecretString::from(req.user_password))
            .map_err(|err| Status::invalid_argument(err.to_string()))?;
        let date_of_birth = date_from_unix(req.date_of_birth)
            .map_err(|err| Status::invalid_argument(err.to_string()))?;

        let new_user = NewUser {
            username,
            email,
            first_name: req.first_name,
            last_name: req.last_name,
            date_of_birth,
            password,
        };
        match self.storage.add_user(&new_user).await {
            Ok(user_id) => {
                info!("Created user {} ({})", new_user.username, user_id);
                self.instruments.count(Metric::UsersCreated, 1, &[]);
                Ok(Response::new(protobuf::CreateUserResponse {
                    status: RespStatus::Ok as i32,
                    user_id: user_id.as_i64(),
                }))
            }
            Err(storage::Error::UsernameClaimed { .. }) => {
                Ok(Response::new(protobuf::CreateUserResponse {
                    status: RespStatus::UsernameExisted as i32,
                    user_id: 0,
                }))
            }
            Err(storage::Error::EmailClaimed { .. }) => {
                Ok(Response::new(protobuf::CreateUserResponse {
                    status: RespStatus::EmailExisted as i32,
                    user_id: 0,
                }))
            }
            Err(err) => Err(storage_to_status(err)),
        }
    }

    async fn check_user_authentication(
        &self,
        request: Request<protobuf::CheckUserAuthenticationRequest>,
    ) -> RpcResult<protobuf::CheckUserAuthenticationResponse> {
        use protobuf::check_user_authentication_response::Status as RespStatus;
        let req = request.into_inner();

        let Some(user) = self
            .storage
            .user_for_name(&req.user_name)
            .await
            .map_err(storage_to_status)?
        else {
            return Ok(Response::new(protobuf::CheckUserAuthenticationResponse {
                status: RespStatus::UserNotFound as i32,
                user_id: 0,
            }));
        };

        // A password that doesn't even satisfy the password rules can't be the right one
        let verdict = Password::new(SecretString::from(req.user_password))
            .and_then(|password| user.check_password(&password));
        match verdict {
            Ok(()) => Ok(Response::new(protobuf::CheckUserAuthenticationResponse {
                status: RespStatus::Ok as i32,
                user_id: user.id.as_i64(),
            })),
            Err(crate::entities::Error::Bcrypt { source, .. }) => {
                error!("bcrypt failure checking a password: {}", source);
                Err(Status::internal("password verification failure"))
            }
            Err(_) => Ok(Response::new(protobuf::CheckUserAuthenticationResponse {
                status: RespStatus::WrongPassword as i32,
                user_id: 0,
            })),
        }
    }

    async fn get_user_detail_info(
        &self,
        request: Request<protobuf::GetUserDetailInfoRequest>,
    ) -> RpcResult<protobuf::GetUserDetailInfoResponse> {
        use protobuf::get_user_detail_info_response::Status as RespStatus;
        let req = request.into_inner();
        match self
            .storage
            .user_by_id(UserId::new(req.user_id))
            .await
            .map_err(storage_to_status)?
        {
            Some(user) => Ok(Response::new(protobuf::GetUserDetailInfoResponse {
                status: RespStatus::Ok as i32,
                user: Some(user.profile().into()),
            })),
            None => Ok(Response::new(protobuf::GetUserDetailInfoResponse {
                status: RespStatus::UserNotFound as i32,
                user: None,
            })),
        }
    }

    async fn edit_user(
        &self,
        request: Request<protobuf::EditUserRequest>,
    ) -> RpcResult<protobuf::EditUserResponse> {
        use protobuf::edit_user_response::Status as RespStatus;
        let req = request.into_inner();

        let update = UserUpdate {
            password: req
                .user_password
                .map(|p| Password::new(SecretString::from(p)))
                .transpose()
                .map_err(|err| Status::invalid_argument(err.to_string()))?,
            first_name: req.first_name,
            last_name: req.last_name,
            date_of_birth: req
                .date_of_birth
                .map(date_from_unix)
                .transpose()
                .map_err(|err| Status::invalid_argument(err.to_string()))?,
        };
        let status = if self
            .storage
            .update_user(UserId::new(req.user_id), &update)
            .await
            .map_err(storage_to_status)?
        {
            RespStatus::Ok
        } else {
            RespStatus::UserNotFound
        };
        Ok(Response::new(protobuf::EditUserResponse {
            status: status as i32,
        }))
    }

    async fn follow_user(
        &self,
        request: Request<protobuf::FollowUserRequest>,
    ) -> RpcResult<protobuf::FollowUserResponse> {
        use protobuf::follow_user_response::Status as RespStatus;
        let req = request.into_inner();
        let (user_id, following_id) = (UserId::new(req.user_id), UserId::new(req.following_id));

        // Self-follows are rejected up front, before any datastore round-trip
        if user_id == following_id {
            debug!("{} attempted to follow themselves", user_id);
            return Ok(Response::new(protobuf::FollowUserResponse {
                status: RespStatus::AlreadyFollowed as i32,
            }));
        }
        if !self.user_exists(user_id).await? || !self.user_exists(following_id).await? {
            return Ok(Response::new(protobuf::FollowUserResponse {
                status: RespStatus::UserNotFound as i32,
            }));
        }
        let status = if self
            .storage
            .add_follow(user_id, following_id)
            .await
            .map_err(storage_to_status)?
        {
            RespStatus::Ok
        } else {
            RespStatus::AlreadyFollowed
        };
        Ok(Response::new(protobuf::FollowUserResponse {
            status: status as i32,
        }))
    }

    async fn unfollow_user(
        &self,
        request: Request<protobuf::UnfollowUserRequest>,
    ) -> RpcResult<protobuf::UnfollowUserResponse> {
        use protobuf::unfollow_user_response::Status as RespStatus;
        let req = request.into_inner();
        let (user_id, following_id) = (UserId::new(req.user_id), UserId::new(req.following_id));

        if !self.user_exists(user_id).await? || !self.user_exists(following_id).await? {
            return Ok(Response::new(protobuf::UnfollowUserResponse {
                status: RespStatus::UserNotFound as i32,
            }));
        }
        let status = if self
            .storage
            .remove_follow(user_id, following_id)
            .await
            .map_err(storage_to_status)?
        {
            RespStatus::Ok
        } else {
            RespStatus::NotFollowed
        };
        Ok(Response::new(protobuf::UnfollowUserResponse {
            status: status as i32,
        }))
    }

    async fn get_user_follower(
        &self,
        request: Request<protobuf::GetUserFollowerRequest>,
    ) -> RpcResult<protobuf::GetUserFollowerResponse> {
        use protobuf::get_user_follower_response::Status as RespStatus;
        let req = request.into_inner();
        let user_id = UserId::new(req.user_id);
        if !self.user_exists(user_id).await? {
            return Ok(Response::new(protobuf::GetUserFollowerResponse {
                status: RespStatus::UserNotFound as i32,
                followers_ids: vec![],
            }));
        }
        let followers = self
            .storage
            .followers_of(user_id)
            .await
            .map_err(storage_to_status)?;
        Ok(Response::new(protobuf::GetUserFollowerResponse {
            status: RespStatus::Ok as i32,
            followers_ids: followers.into_iter().map(|id| id.as_i64()).collect(),
        }))
    }

    async fn get_user_following(
        &self,
        request: Request<protobuf::GetUserFollowingRequest>,
    ) -> RpcResult<protobuf::GetUserFollowingResponse> {
        use protobuf::get_user_following_response::Status as RespStatus;
        let req = request.into_inner();
        let user_id = UserId::new(req.user_id);
        if !self.user_exists(user_id).await? {
            return Ok(Response::new(protobuf::GetUserFollowingResponse {
                status: RespStatus::UserNotFound as i32,
                followings_ids: vec![],
            }));
        }
        let followings = self
            .storage
            .followings_of(user_id)
            .await
            .map_err(storage_to_status)?;
        Ok(Response::new(protobuf::GetUserFollowingResponse {
            status: RespStatus::Ok as i32,
            followings_ids: followings.into_iter().map(|id| id.as_i64()).collect(),
        }))
    }

    async fn get_user_posts(
        &self,
        request: Request<protobuf::GetUserPostsRequest>,
    ) -> RpcResult<protobuf::GetUserPostsResponse> {
        use protobuf::get_user_posts_response::Status as RespStatus;
        let req = request.into_inner();
        let user_id = UserId::new(req.user_id);
        if !self.user_exists(user_id).await? {
            return Ok(Response::new(protobuf::GetUserPostsResponse {
                status: RespStatus::UserNotFound as i32,
                posts_ids: vec![],
            }));
        }
        let posts = self
            .storage
            .posts_of(user_id)
            .await
            .map_err(storage_to_status)?;
        Ok(Response::new(protobuf::GetUserPostsResponse {
            status: RespStatus::Ok as i32,
            posts_ids: posts.into_iter().map(|id| id.as_i64()).collect(),
        }))
    }

    async fn create_post(
        &self,
        request: Request<protobuf::CreatePostRequest>,
    ) -> RpcResult<protobuf::CreatePostResponse> {
        use protobuf::create_post_response::Status as RespStatus;
        let req = request.into_inner();
        let user_id = UserId::new(req.user_id);
        if !self.user_exists(user_id).await? {
            return Ok(Response::new(protobuf::CreatePostResponse {
                status: RespStatus::UserNotFound as i32,
                post_id: 0,
            }));
        }
        let post_id = self
            .storage
            .add_post(&NewPost {
                user_id,
                content_text: req.content_text,
                content_image_path: req.content_image_path,
                visible: req.visible,
            })
            .await
            .map_err(storage_to_status)?;
        self.instruments.count(Metric::PostsCreated, 1, &[]);

        // The row is committed; fan-out is best-effort from here on out.
        if let Some(publisher) = self.publisher.clone() {
            let instruments = self.instruments.clone();
            tokio::spawn(async move {
                let result = tokio::time::timeout(
                    NOTIFY_TIMEOUT,
                    publisher.publish_post(protobuf::PublishPostRequest {
                        user_id: user_id.as_i64(),
                        post_id: post_id.as_i64(),
                    }),
                )
                .await;
                match result {
                    Ok(Ok(_)) => debug!("Published post {} for fan-out", post_id),
                    Ok(Err(err)) => {
                        warn!("Failed to publish post {} for fan-out: {}", post_id, err);
                        instruments.count(Metric::PublishFailures, 1, &[]);
                    }
                    Err(_) => {
                        warn!("Timed-out publishing post {} for fan-out", post_id);
                        instruments.count(Metric::PublishFailures, 1, &[]);
                    }
                }
            });
        }

        Ok(Response::new(protobuf::CreatePostResponse {
            status: RespStatus::Ok as i32,
            post_id: post_id.as_i64(),
        }))
    }

    async fn get_post_detail_info(
        &self,
        request: Request<protobuf::GetPostDetailInfoRequest>,
    ) -> RpcResult<protobuf::GetPostDetailInfoResponse> {
        use protobuf::get_post_detail_info_response::Status as RespStatus;
        let req = request.into_inner();
        let post_id = PostId::new(req.post_id);

        // Hidden posts are invisible to readers (their authors can still Edit them back)
        let post = match self
            .storage
            .post_by_id(post_id)
            .await
            .map_err(storage_to_status)?
        {
            Some(post) if post.visible() => post,
            _ => {
                return Ok(Response::new(protobuf::GetPostDetailInfoResponse {
                    status: RespStatus::PostNotFound as i32,
                    post: None,
                }))
            }
        };
        let comments = self
            .storage
            .comments_for(post_id)
            .await
            .map_err(storage_to_status)?;
        let users_liked = self
            .storage
            .likers_of(post_id)
            .await
            .map_err(storage_to_status)?;
        Ok(Response::new(protobuf::GetPostDetailInfoResponse {
            status: RespStatus::Ok as i32,
            post: Some(
                PostDetail {
                    post,
                    comments,
                    users_liked,
                }
                .into(),
            ),
        }))
    }

    async fn edit_post(
        &self,
        request: Request<protobuf::EditPostRequest>,
    ) -> RpcResult<protobuf::EditPostResponse> {
        use protobuf::edit_post_response::Status as RespStatus;
        let req = request.into_inner();
        let user_id = UserId::new(req.user_id);

        if !self.user_exists(user_id).await? {
            return Ok(Response::new(protobuf::EditPostResponse {
                status: RespStatus::UserNotFound as i32,
            }));
        }
        // Unscoped lookup: authors may edit hidden posts (to un-hide them, for one)
        let Some(post) = self
            .storage
            .post_by_id(PostId::new(req.post_id))
            .await
            .map_err(storage_to_status)?
        else {
            return Ok(Response::new(protobuf::EditPostResponse {
                status: RespStatus::PostNotFound as i32,
            }));
        };
        if post.user_id != user_id {
            return Ok(Response::new(protobuf::EditPostResponse {
                status: RespStatus::NotAllowed as i32,
            }));
        }
        self.storage
            .update_post(
                post.id,
                &PostUpdate {
                    content_text: req.content_text,
                    content_image_path: req.content_image_path.map(|p| p.paths),
                    visible: req.visible,
                },
            )
            .await
            .map_err(storage_to_status)?;
        Ok(Response::new(protobuf::EditPostResponse {
            status: RespStatus::Ok as i32,
        }))
    }

    async fn delete_post(
        &self,
        request: Request<protobuf::DeletePostRequest>,
    ) -> RpcResult<protobuf::DeletePostResponse> {
        use protobuf::delete_post_response::Status as RespStatus;
        let req = request.into_inner();
        let user_id = UserId::new(req.user_id);

        if !self.user_exists(user_id).await? {
            return Ok(Response::new(protobuf::DeletePostResponse {
                status: RespStatus::UserNotFound as i32,
            }));
        }
        let Some(post) = self
            .storage
            .post_by_id(PostId::new(req.post_id))
            .await
            .map_err(storage_to_status)?
        else {
            return Ok(Response::new(protobuf::DeletePostResponse {
                status: RespStatus::PostNotFound as i32,
            }));
        };
        if post.user_id != user_id {
            return Ok(Response::new(protobuf::DeletePostResponse {
                status: RespStatus::NotAllowed as i32,
            }));
        }
        self.storage
            .delete_post_cascade(post.id)
            .await
            .map_err(storage_to_status)?;
        info!("Deleted post {} (and its comments & likes)", post.id);
        self.instruments.count(Metric::PostsDeleted, 1, &[]);

        // Committed; now ask the newsfeed reader to sweep the feeds, best-effort
        if let Some(newsfeed) = self.newsfeed.clone() {
            let instruments = self.instruments.clone();
            let post_id = post.id;
            tokio::spawn(async move {
                let result = tokio::time::timeout(
                    NOTIFY_TIMEOUT,
                    newsfeed.remove_post_from_newsfeed(protobuf::RemovePostFromNewsfeedRequest {
                        post_id: post_id.as_i64(),
                    }),
                )
                .await;
                match result {
                    Ok(Ok(_)) => debug!("Requested newsfeed sweep for post {}", post_id),
                    Ok(Err(err)) => {
                        warn!("Newsfeed sweep for post {} failed: {}", post_id, err);
                        instruments.count(Metric::SweepFailures, 1, &[]);
                    }
                    Err(_) => {
                        warn!("Timed-out requesting newsfeed sweep for post {}", post_id);
                        instruments.count(Metric::SweepFailures, 1, &[]);
                    }
                }
            });
        }

        Ok(Response::new(protobuf::DeletePostResponse {
            status: RespStatus::Ok as i32,
        }))
    }

    async fn comment_post(
        &self,
        request: Request<protobuf::CommentPostRequest>,
    ) -> RpcResult<protobuf::CommentPostResponse> {
        use protobuf::comment_post_response::Status as RespStatus;
        let req = request.into_inner();
        let user_id = UserId::new(req.user_id);

        if !self.user_exists(user_id).await? {
            return Ok(Response::new(protobuf::CommentPostResponse {
                status: RespStatus::UserNotFound as i32,
                comment_id: 0,
            }));
        }
        match self
            .storage
            .post_by_id(PostId::new(req.post_id))
            .await
            .map_err(storage_to_status)?
        {
            Some(post) if post.visible() => {
                let comment_id = self
                    .storage
                    .add_comment(post.id, user_id, &req.content_text)
                    .await
                    .map_err(storage_to_status)?;
                Ok(Response::new(protobuf::CommentPostResponse {
                    status: RespStatus::Ok as i32,
                    comment_id: comment_id.as_i64(),
                }))
            }
            _ => Ok(Response::new(protobuf::CommentPostResponse {
                status: RespStatus::PostNotFound as i32,
                comment_id: 0,
            })),
        }
    }

    async fn like_post(
        &self,
        request: Request<protobuf::LikePostRequest>,
    ) -> RpcResult<protobuf::LikePostResponse> {
        use protobuf::like_post_response::Status as RespStatus;
        let req = request.into_inner();
        let user_id = UserId::new(req.user_id);

        if !self.user_exists(user_id).await? {
            return Ok(Response::new(protobuf::LikePostResponse {
                status: RespStatus::UserNotFound as i32,
            }));
        }
        match self
            .storage
            .post_by_id(PostId::new(req.post_id))
            .await
            .map_err(storage_to_status)?
        {
            Some(post) if post.visible() => {
                // Idempotent: re-liking is a no-op success
                self.storage
                    .add_like(post.id, user_id)
                    .await
                    .map_err(storage_to_status)?;
                Ok(Response::new(protobuf::LikePostResponse {
                    status: RespStatus::Ok as i32,
                }))
            }
            _ => Ok(Response::new(protobuf::LikePostResponse {
                status: RespStatus::PostNotFound as i32,
            })),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use async_trait::async_trait;
    use std::sync::Mutex;

    use crate::{
        client,
        rpc::{date_to_unix, protobuf::authenticate_and_post_server::AuthenticateAndPost},
        storage::testing::MemoryBackend,
    };

    // A PublishApi that remembers what it was asked to publish
    #[derive(Default)]
    struct RecordingPublisher {
        published: Mutex<Vec<(i64, i64)>>,
        fail: bool,
    }

    #[async_trait]
    impl PublishApi for RecordingPublisher {
        async fn publish_post(
            &self,
            req: protobuf::PublishPostRequest,
        ) -> client::Result<protobuf::PublishPostResponse> {
            if self.fail {
                return Err(client::Error::NoHosts {
                    service: "newsfeed-publishing",
                    backtrace: snafu::Backtrace::capture(),
                });
            }
            self.published
                .lock()
                .unwrap()
                .push((req.user_id, req.post_id));
            Ok(protobuf::PublishPostResponse { status: 0 })
        }
    }

    #[derive(Default)]
    struct RecordingNewsfeed {
        swept: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl NewsfeedApi for RecordingNewsfeed {
        async fn get_newsfeed(
            &self,
            _req: protobuf::GetNewsfeedRequest,
        ) -> client::Result<protobuf::GetNewsfeedResponse> {
            unimplemented!()
        }
        async fn remove_post_from_newsfeed(
            &self,
            req: protobuf::RemovePostFromNewsfeedRequest,
        ) -> client::Result<protobuf::RemovePostFromNewsfeedResponse> {
            self.swept.lock().unwrap().push(req.post_id);
            Ok(protobuf::RemovePostFromNewsfeedResponse { status: 0 })
        }
    }

    struct Fixture {
        svc: AuthPostService,
        publisher: Arc<RecordingPublisher>,
        newsfeed: Arc<RecordingNewsfeed>,
    }

    fn fixture() -> Fixture {
        let publisher = Arc::new(RecordingPublisher::default());
        let newsfeed = Arc::new(RecordingNewsfeed::default());
        let svc = AuthPostService::new(
            Arc::new(MemoryBackend::default()),
            Some(publisher.clone()),
            Some(newsfeed.clone()),
            Arc::new(Instruments::new("wandersphere")),
        );
        Fixture {
            svc,
            publisher,
            newsfeed,
        }
    }

    async fn signup(svc: &AuthPostService, name: &str, email: &str) -> i64 {
        let rsp = svc
            .create_user(Request::new(protobuf::CreateUserRequest {
                user_name: name.to_owned(),
                user_password: "Abcd1234!".to_owned(),
                first_name: "Test".to_owned(),
                last_name: "User".to_owned(),
                date_of_birth: date_to_unix(
                    chrono::NaiveDate::from_ymd_opt(1990, 1, 1).unwrap(),
                ),
                email: email.to_owned(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(rsp.status, protobuf::create_user_response::Status::Ok as i32);
        rsp.user_id
    }

    async fn post(svc: &AuthPostService, user_id: i64, text: &str) -> i64 {
        let rsp = svc
            .create_post(Request::new(protobuf::CreatePostRequest {
                user_id,
                content_text: text.to_owned(),
                content_image_path: vec![],
                visible: true,
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(rsp.status, protobuf::create_post_response::Status::Ok as i32);
        rsp.post_id
    }

    // Spawned notifications land on other tasks; give the runtime a beat to drive them.
    async fn settle() {
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn duplicate_usernames_and_emails_are_conflicts() {
        let fx = fixture();
        signup(&fx.svc, "alice01", "a@x").await;

        let rsp = fx
            .svc
            .create_user(Request::new(protobuf::CreateUserRequest {
                user_name: "alice01".to_owned(),
                user_password: "Abcd1234!".to_owned(),
                first_name: String::new(),
                last_name: String::new(),
                date_of_birth: 0,
                email: "b@x".to_owned(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(
            rsp.status,
            protobuf::create_user_response::Status::UsernameExisted as i32
        );

        let rsp = fx
            .svc
            .create_user(Request::new(protobuf::CreateUserRequest {
                user_name: "alice02".to_owned(),
                user_password: "Abcd1234!".to_owned(),
                first_name: String::new(),
                last_name: String::new(),
                date_of_birth: 0,
                email: "a@x".to_owned(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(
            rsp.status,
            protobuf::create_user_response::Status::EmailExisted as i32
        );
    }

    #[tokio::test]
    async fn authentication_round_trip() {
        let fx = fixture();
        let user_id = signup(&fx.svc, "alice01", "a@x").await;

        let rsp = fx
            .svc
            .check_user_authentication(Request::new(protobuf::CheckUserAuthenticationRequest {
                user_name: "alice01".to_owned(),
                user_password: "Abcd1234!".to_owned(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(
            rsp.status,
            protobuf::check_user_authentication_response::Status::Ok as i32
        );
        assert_eq!(rsp.user_id, user_id);

        let rsp = fx
            .svc
            .check_user_authentication(Request::new(protobuf::CheckUserAuthenticationRequest {
                user_name: "alice01".to_owned(),
                user_password: "Abcd1234?".to_owned(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(
            rsp.status,
            protobuf::check_user_authentication_response::Status::WrongPassword as i32
        );

        let rsp = fx
            .svc
            .check_user_authentication(Request::new(protobuf::CheckUserAuthenticationRequest {
                user_name: "nobody99".to_owned(),
                user_password: "Abcd1234!".to_owned(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(
            rsp.status,
            protobuf::check_user_authentication_response::Status::UserNotFound as i32
        );
    }

    #[tokio::test]
    async fn follows_are_idempotent_and_self_follow_is_rejected() {
        let fx = fixture();
        let alice = signup(&fx.svc, "alice01", "a@x").await;
        let bob = signup(&fx.svc, "bob01", "b@x").await;

        // Self-follow never creates an edge
        let rsp = fx
            .svc
            .follow_user(Request::new(protobuf::FollowUserRequest {
                user_id: alice,
                following_id: alice,
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(
            rsp.status,
            protobuf::follow_user_response::Status::AlreadyFollowed as i32
        );
        let rsp = fx
            .svc
            .get_user_following(Request::new(protobuf::GetUserFollowingRequest {
                user_id: alice,
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(rsp.followings_ids.is_empty());

        // First follow succeeds, the second reports the conflict & doesn't duplicate the edge
        let rsp = fx
            .svc
            .follow_user(Request::new(protobuf::FollowUserRequest {
                user_id: alice,
                following_id: bob,
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(rsp.status, protobuf::follow_user_response::Status::Ok as i32);
        let rsp = fx
            .svc
            .follow_user(Request::new(protobuf::FollowUserRequest {
                user_id: alice,
                following_id: bob,
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(
            rsp.status,
            protobuf::follow_user_response::Status::AlreadyFollowed as i32
        );
        let rsp = fx
            .svc
            .get_user_following(Request::new(protobuf::GetUserFollowingRequest {
                user_id: alice,
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(rsp.followings_ids, vec![bob]);
        let rsp = fx
            .svc
            .get_user_follower(Request::new(protobuf::GetUserFollowerRequest {
                user_id: bob,
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(rsp.followers_ids, vec![alice]);
    }

    #[tokio::test]
    async fn create_post_publishes_for_fan_out() {
        let fx = fixture();
        let alice = signup(&fx.svc, "alice01", "a@x").await;
        let post_id = post(&fx.svc, alice, "hi").await;
        settle().await;
        assert_eq!(
            fx.publisher.published.lock().unwrap().as_slice(),
            &[(alice, post_id)]
        );
    }

    #[tokio::test]
    async fn publish_failure_does_not_fail_create_post() {
        let publisher = Arc::new(RecordingPublisher {
            published: Mutex::new(vec![]),
            fail: true,
        });
        let svc = AuthPostService::new(
            Arc::new(MemoryBackend::default()),
            Some(publisher.clone()),
            None,
            Arc::new(Instruments::new("wandersphere")),
        );
        let alice = signup(&svc, "alice01", "a@x").await;
        // Still OK even though the publisher errors
        let post_id = post(&svc, alice, "hi").await;
        assert!(post_id > 0);
    }

    #[tokio::test]
    async fn cascading_delete_and_sweep() {
        let fx = fixture();
        let alice = signup(&fx.svc, "alice01", "a@x").await;
        let bob = signup(&fx.svc, "bob01", "b@x").await;
        let post_id = post(&fx.svc, alice, "hi").await;

        let rsp = fx
            .svc
            .comment_post(Request::new(protobuf::CommentPostRequest {
                user_id: bob,
                post_id,
                content_text: "nice".to_owned(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(rsp.status, protobuf::comment_post_response::Status::Ok as i32);
        let rsp = fx
            .svc
            .like_post(Request::new(protobuf::LikePostRequest {
                user_id: bob,
                post_id,
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(rsp.status, protobuf::like_post_response::Status::Ok as i32);

        // A non-author may not delete
        let rsp = fx
            .svc
            .delete_post(Request::new(protobuf::DeletePostRequest {
                user_id: bob,
                post_id,
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(
            rsp.status,
            protobuf::delete_post_response::Status::NotAllowed as i32
        );

        let rsp = fx
            .svc
            .delete_post(Request::new(protobuf::DeletePostRequest {
                user_id: alice,
                post_id,
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(rsp.status, protobuf::delete_post_response::Status::Ok as i32);

        let rsp = fx
            .svc
            .get_post_detail_info(Request::new(protobuf::GetPostDetailInfoRequest { post_id }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(
            rsp.status,
            protobuf::get_post_detail_info_response::Status::PostNotFound as i32
        );

        settle().await;
        assert_eq!(fx.newsfeed.swept.lock().unwrap().as_slice(), &[post_id]);
    }

    #[tokio::test]
    async fn likes_are_idempotent() {
        let fx = fixture();
        let alice = signup(&fx.svc, "alice01", "a@x").await;
        let bob = signup(&fx.svc, "bob01", "b@x").await;
        let post_id = post(&fx.svc, alice, "hi").await;

        for _ in 0..2 {
            let rsp = fx
                .svc
                .like_post(Request::new(protobuf::LikePostRequest {
                    user_id: bob,
                    post_id,
                }))
                .await
                .unwrap()
                .into_inner();
            assert_eq!(rsp.status, protobuf::like_post_response::Status::Ok as i32);
        }
        let rsp = fx
            .svc
            .get_post_detail_info(Request::new(protobuf::GetPostDetailInfoRequest { post_id }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(rsp.post.unwrap().users_liked, vec![bob]);
    }

    #[tokio::test]
    async fn hidden_posts_are_invisible_but_editable() {
        let fx = fixture();
        let alice = signup(&fx.svc, "alice01", "a@x").await;
        let rsp = fx
            .svc
            .create_post(Request::new(protobuf::CreatePostRequest {
                user_id: alice,
                content_text: "secret".to_owned(),
                content_image_path: vec![],
                visible: false,
            }))
            .await
            .unwrap()
            .into_inner();
        let post_id = rsp.post_id;

        let rsp = fx
            .svc
            .get_post_detail_info(Request::new(protobuf::GetPostDetailInfoRequest { post_id }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(
            rsp.status,
            protobuf::get_post_detail_info_response::Status::PostNotFound as i32
        );

        // Flipping `visible` back on restores it
        let rsp = fx
            .svc
            .edit_post(Request::new(protobuf::EditPostRequest {
                user_id: alice,
                post_id,
                content_text: None,
                content_image_path: None,
                visible: Some(true),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(rsp.status, protobuf::edit_post_response::Status::Ok as i32);
        let rsp = fx
            .svc
            .get_post_detail_info(Request::new(protobuf::GetPostDetailInfoRequest { post_id }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(
            rsp.status,
            protobuf::get_post_detail_info_response::Status::Ok as i32
        );
    }

    #[tokio::test]
    async fn edit_user_applies_only_present_fields() {
        let fx = fixture();
        let alice = signup(&fx.svc, "alice01", "a@x").await;
        let rsp = fx
            .svc
            .edit_user(Request::new(protobuf::EditUserRequest {
                user_id: alice,
                user_password: Some("NewPass99!".to_owned()),
                first_name: Some("Alicia".to_owned()),
                last_name: None,
                date_of_birth: None,
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(rsp.status, protobuf::edit_user_response::Status::Ok as i32);

        // Old password no longer verifies, new one does
        let rsp = fx
            .svc
            .check_user_authentication(Request::new(protobuf::CheckUserAuthenticationRequest {
                user_name: "alice01".to_owned(),
                user_password: "Abcd1234!".to_owned(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(
            rsp.status,
            protobuf::check_user_authentication_response::Status::WrongPassword as i32
        );
        let rsp = fx
            .svc
            .check_user_authentication(Request::new(protobuf::CheckUserAuthenticationRequest {
                user_name: "alice01".to_owned(),
                user_password: "NewPass99!".to_owned(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(
            rsp.status,
            protobuf::check_user_authentication_response::Status::Ok as i32
        );

        let rsp = fx
            .svc
            .get_user_detail_info(Request::new(protobuf::GetUserDetailInfoRequest {
                user_id: alice,
            }))
            .await
            .unwrap()
            .into_inner();
        let user = rsp.user.unwrap();
        assert_eq!(user.first_name, "Alicia");
        assert_eq!(user.last_name, "User");

        let rsp = fx
            .svc
            .edit_user(Request::new(protobuf::EditUserRequest {
                user_id: 9999,
                user_password: None,
                first_name: None,
                last_name: None,
                date_of_birth: None,
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(
            rsp.status,
            protobuf::edit_user_response::Status::UserNotFound as i32
        );
    }
}
