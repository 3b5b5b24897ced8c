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

//! # wandersphere as an RPC client
//!
//! Client-side plumbing for the three intra-cluster service surfaces. Each dependency is
//! configured with a static list of `host:port` endpoints; every call picks one at random
//! (poor-man's load balancing, inherited from the original deployment & good enough for a handful
//! of replicas behind stable addresses). An empty endpoint list is a configuration error & is
//! rejected at startup, not at call time.
//!
//! The consuming services hold these behind object-safe traits ([AuthPostApi], [NewsfeedApi],
//! [PublishApi], [FollowerSource]) so that tests can substitute in-process fakes.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use snafu::{prelude::*, Backtrace};
use tonic::transport::{Channel, Endpoint};

use crate::{
    entities::UserId,
    rpc::protobuf::{
        authenticate_and_post_client::AuthenticateAndPostClient,
        newsfeed_client::NewsfeedClient, newsfeed_publishing_client::NewsfeedPublishingClient, *,
    },
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to connect to {host}: {source}"))]
    Connect {
        host: String,
        source: tonic::transport::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("{host} is not a valid endpoint: {source}"))]
    InvalidHost {
        host: String,
        source: tonic::transport::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("No hosts configured for {service}"))]
    NoHosts {
        service: &'static str,
        backtrace: Backtrace,
    },
    #[snafu(display("RPC failed: {source}"))]
    Rpc {
        source: tonic::Status,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Endpoints                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Timeout for dialing any one endpoint
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default per-call deadline
const CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// A non-empty, static list of `host:port` endpoints for one dependency
#[derive(Clone, Debug)]
pub struct Endpoints {
    hosts: Vec<String>,
}

impl Endpoints {
    pub fn new(service: &'static str, hosts: Vec<String>) -> Result<Endpoints> {
        if hosts.is_empty() {
            NoHostsSnafu { service }.fail()
        } else {
            Ok(Endpoints { hosts })
        }
    }
    /// Pick an endpoint at random
    pub fn pick(&self) -> &str {
        &self.hosts[rand::thread_rng().gen_range(0..self.hosts.len())]
    }
    async fn connect(&self) -> Result<Channel> {
        let host = self.pick();
        Endpoint::from_shared(format!("http://{}", host))
            .context(InvalidHostSnafu {
                host: host.to_owned(),
            })?
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(CALL_TIMEOUT)
            .connect()
            .await
            .context(ConnectSnafu {
                host: host.to_owned(),
            })
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        service surfaces                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The authoring service, as its callers see it
#[async_trait]
pub trait AuthPostApi {
    async fn create_user(&self, req: CreateUserRequest) -> Result<CreateUserResponse>;
    async fn check_user_authentication(
        &self,
        req: CheckUserAuthenticationRequest,
    ) -> Result<CheckUserAuthenticationResponse>;
    async fn get_user_detail_info(
        &self,
        req: GetUserDetailInfoRequest,
    ) -> Result<GetUserDetailInfoResponse>;
    async fn edit_user(&self, req: EditUserRequest) -> Result<EditUserResponse>;
    async fn follow_user(&self, req: FollowUserRequest) -> Result<FollowUserResponse>;
    async fn unfollow_user(&self, req: UnfollowUserRequest) -> Result<UnfollowUserResponse>;
    async fn get_user_follower(
        &self,
        req: GetUserFollowerRequest,
    ) -> Result<GetUserFollowerResponse>;
    async fn get_user_following(
        &self,
        req: GetUserFollowingRequest,
    ) -> Result<GetUserFollowingResponse>;
    async fn get_user_posts(&self, req: GetUserPostsRequest) -> Result<GetUserPostsResponse>;
    async fn create_post(&self, req: CreatePostRequest) -> Result<CreatePostResponse>;
    async fn get_post_detail_info(
        &self,
        req: GetPostDetailInfoRequest,
    ) -> Result<GetPostDetailInfoResponse>;
    async fn edit_post(&self, req: EditPostRequest) -> Result<EditPostResponse>;
    async fn delete_post(&self, req: DeletePostRequest) -> Result<DeletePostResponse>;
    async fn comment_post(&self, req: CommentPostRequest) -> Result<CommentPostResponse>;
    async fn like_post(&self, req: LikePostRequest) -> Result<LikePostResponse>;
}

/// The newsfeed reader, as its callers see it
#[async_trait]
pub trait NewsfeedApi {
    async fn get_newsfeed(&self, req: GetNewsfeedRequest) -> Result<GetNewsfeedResponse>;
    async fn remove_post_from_newsfeed(
        &self,
        req: RemovePostFromNewsfeedRequest,
    ) -> Result<RemovePostFromNewsfeedResponse>;
}

/// The newsfeed publisher, as its callers see it
#[async_trait]
pub trait PublishApi {
    async fn publish_post(&self, req: PublishPostRequest) -> Result<PublishPostResponse>;
}

/// Just the follower-resolution slice of [AuthPostApi]; all the fan-out worker needs
#[async_trait]
pub trait FollowerSource {
    async fn follower_ids(&self, user_id: UserId) -> Result<Vec<UserId>>;
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         gRPC clients                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// gRPC-backed [AuthPostApi] (and [FollowerSource])
pub struct GrpcAuthPost {
    endpoints: Endpoints,
}

impl GrpcAuthPost {
    pub fn new(hosts: Vec<String>) -> Result<GrpcAuthPost> {
        Ok(GrpcAuthPost {
            endpoints: Endpoints::new("authpost", hosts)?,
        })
    }
    async fn client(&self) -> Result<AuthenticateAndPostClient<Channel>> {
        Ok(AuthenticateAndPostClient::new(
            self.endpoints.connect().await?,
        ))
    }
}

macro_rules! unary {
    ($self:ident, $method:ident, $req:expr) => {
        $self
            .client()
            .await?
            .$method($req)
            .await
            .map(|rsp| rsp.into_inner())
            .context(RpcSnafu)
    };
}

#[async_trait]
impl AuthPostApi for GrpcAuthPost {
    async fn create_user(&self, req: CreateUserRequest) -> Result<CreateUserResponse> {
        unary!(self, create_user, req)
    }
    async fn check_user_authentication(
        &self,
        req: CheckUserAuthenticationRequest,
    ) -> Result<CheckUserAuthenticationResponse> {
        unary!(self, check_user_authentication, req)
    }
    async fn get_user_detail_info(
        &self,
        req: GetUserDetailInfoRequest,
    ) -> Result<GetUserDetailInfoResponse> {
        unary!(self, get_user_detail_info, req)
    }
    async fn edit_user(&self, req: EditUserRequest) -> Result<EditUserResponse> {
        unary!(self, edit_user, req)
    }
    async fn follow_user(&self, req: FollowUserRequest) -> Result<FollowUserResponse> {
        unary!(self, follow_user, req)
    }
    async fn unfollow_user(&self, req: UnfollowUserRequest) -> Result<UnfollowUserResponse> {
        unary!(self, unfollow_user, req)
    }
    async fn get_user_follower(
        &self,
        req: GetUserFollowerRequest,
    ) -> Result<GetUserFollowerResponse> {
        unary!(self, get_user_follower, req)
    }
    async fn get_user_following(
        &self,
        req: GetUserFollowingRequest,
    ) -> Result<GetUserFollowingResponse> {
        unary!(self, get_user_following, req)
    }
    async fn get_user_posts(&self, req: GetUserPostsRequest) -> Result<GetUserPostsResponse> {
        unary!(self, get_user_posts, req)
    }
    async fn create_post(&self, req: CreatePostRequest) -> Result<CreatePostResponse> {
        unary!(self, create_post, req)
    }
    async fn get_post_detail_info(
        &self,
        req: GetPostDetailInfoRequest,
    ) -> Result<GetPostDetailInfoResponse> {
        unary!(self, get_post_detail_info, req)
    }
    async fn edit_post(&self, req: EditPostRequest) -> Result<EditPostResponse> {
        unary!(self, edit_post, req)
    }
    async fn delete_post(&self, req: DeletePostRequest) -> Result<DeletePostResponse> {
        unary!(self, delete_post, req)
    }
    async fn comment_post(&self, req: CommentPostRequest) -> Result<CommentPostResponse> {
        unary!(self, comment_post, req)
    }
    async fn like_post(&self, req: LikePostRequest) -> Result<LikePostResponse> {
        unary!(self, like_post, req)
    }
}

#[async_trait]
impl FollowerSource for GrpcAuthPost {
    async fn follower_ids(&self, user_id: UserId) -> Result<Vec<UserId>> {
        let rsp = self
            .get_user_follower(GetUserFollowerRequest {
                user_id: user_id.as_i64(),
            })
            .await?;
        // USER_NOT_FOUND degenerates to "no followers"; the record is still consumed
        Ok(rsp
            .followers_ids
            .into_iter()
            .map(UserId::new)
            .collect())
    }
}

/// gRPC-backed [NewsfeedApi]
pub struct GrpcNewsfeed {
    endpoints: Endpoints,
}

impl GrpcNewsfeed {
    pub fn new(hosts: Vec<String>) -> Result<GrpcNewsfeed> {
        Ok(GrpcNewsfeed {
            endpoints: Endpoints::new("newsfeed", hosts)?,
        })
    }
    async fn client(&self) -> Result<NewsfeedClient<Channel>> {
        Ok(NewsfeedClient::new(self.endpoints.connect().await?))
    }
}

#[async_trait]
impl NewsfeedApi for GrpcNewsfeed {
    async fn get_newsfeed(&self, req: GetNewsfeedRequest) -> Result<GetNewsfeedResponse> {
        unary!(self, get_newsfeed, req)
    }
    async fn remove_post_from_newsfeed(
        &self,
        req: RemovePostFromNewsfeedRequest,
    ) -> Result<RemovePostFromNewsfeedResponse> {
        unary!(self, remove_post_from_newsfeed, req)
    }
}

/// gRPC-backed [PublishApi]
pub struct GrpcPublisher {
    endpoints: Endpoints,
}

impl GrpcPublisher {
    pub fn new(hosts: Vec<String>) -> Result<GrpcPublisher> {
        Ok(GrpcPublisher {
            endpoints: Endpoints::new("newsfeed-publishing", hosts)?,
        })
    }
    async fn client(&self) -> Result<NewsfeedPublishingClient<Channel>> {
        Ok(NewsfeedPublishingClient::new(
            self.endpoints.connect().await?,
        ))
    }
}

#[async_trait]
impl PublishApi for GrpcPublisher {
    async fn publish_post(&self, req: PublishPostRequest) -> Result<PublishPostResponse> {
        unary!(self, publish_post, req)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_host_lists_are_fatal() {
        assert!(Endpoints::new("authpost", vec![]).is_err());
        assert!(Endpoints::new("authpost", vec!["localhost:1234".to_owned()]).is_ok());
    }

    #[test]
    fn pick_stays_in_bounds() {
        let endpoints = Endpoints::new(
            "newsfeed",
            vec!["a:1".to_owned(), "b:2".to_owned(), "c:3".to_owned()],
        )
        .unwrap();
        for _ in 0..100 {
            assert!(["a:1", "b:2", "c:3"].contains(&endpoints.pick()));
        }
    }
}
