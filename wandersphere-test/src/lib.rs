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

//! # The wandersphere Integration Tests
//!
//! The Rust unit & integration testing framework is really oriented toward testing *libraries*,
//! not multi-service systems. These tests run against a live wandersphere deployment (all four
//! daemons plus their backing stores), named by the `WANDERSPHERE_TEST_URL` environment variable--
//! the gateway's base URL. When that variable is unset, every trial is registered as ignored, so
//! a bare `cargo test` stays green on a laptop with nothing running.
//!
//! The harness itself is [libtest-mimic]: each test binary under `tests/` opts out of libtest
//! (`harness = false` in Cargo.toml) & registers its trials by hand, which buys proper fixtures
//! at the cost of a little ceremony.
//!
//! [libtest-mimic]: https://docs.rs/libtest-mimic/latest/libtest_mimic/index.html
//!
//! Because posts fan out asynchronously, several tests poll for an expected feed state with a
//! bounded budget ([Client::await_feed]) rather than asserting immediately.

use std::time::Duration;

use libtest_mimic::Failed;
use reqwest::StatusCode;
use url::Url;
use uuid::Uuid;

use wandersphere_shared::api::{
    CreatePostRequest, CreateUserRequest, ErrorResponse, LoginRequest, LoginResponse,
    NewsfeedResponse, PostDetailResponse, UserFollowingResponse,
};

pub type Result<T> = std::result::Result<T, Failed>;

/// How long we'll wait for asynchronous fan-out (or the deletion sweep) to land
pub const FANOUT_BUDGET: Duration = Duration::from_secs(10);

/// One authenticated wandersphere user, cookie jar included
pub struct Client {
    base: Url,
    http: reqwest::Client,
    pub user_name: String,
    pub user_id: i64,
}

impl Client {
    /// Sign up a fresh user (random username) & log them in
    pub async fn signup_and_login(base: &Url) -> Result<Client> {
        let user_name = format!("it-{}", Uuid::new_v4().simple());
        let http = reqwest::Client::builder().cookie_store(true).build()?;

        let rsp = http
            .post(base.join("/api/v1/users/signup")?)
            .json(&CreateUserRequest {
                user_name: user_name.clone(),
                password: "Abcd1234!".to_owned(),
                first_name: "Integration".to_owned(),
                last_name: "Test".to_owned(),
                date_of_birth: "1990-01-01".to_owned(),
                email: format!("{}@test.invalid", user_name),
            })
            .send()
            .await?;
        assert_eq!(rsp.status(), StatusCode::OK, "signup failed");

        let rsp = http
            .post(base.join("/api/v1/users/login")?)
            .json(&LoginRequest {
                user_name: user_name.clone(),
                password: "Abcd1234!".to_owned(),
            })
            .send()
            .await?;
        assert_eq!(rsp.status(), StatusCode::OK, "login failed");
        let cookie = rsp
            .headers()
            .get(reqwest::header::SET_COOKIE)
            .expect("login sets the session cookie")
            .to_str()?
            .to_owned();
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Strict"));
        let body: LoginResponse = rsp.json().await?;
        assert_eq!(body.user.user_name, user_name);

        Ok(Client {
            base: base.clone(),
            http,
            user_name,
            user_id: body.user.user_id,
        })
    }

    pub async fn follow(&self, user_id: i64) -> Result<reqwest::Response> {
        Ok(self
            .http
            .post(self.base.join(&format!("/api/v1/friends/{}", user_id))?)
            .send()
            .await?)
    }

    pub async fn followings(&self, user_id: i64) -> Result<UserFollowingResponse> {
        Ok(self
            .http
            .get(self
                .base
                .join(&format!("/api/v1/friends/{}/followings", user_id))?)
            .send()
            .await?
            .json()
            .await?)
    }

    pub async fn create_post(&self, text: &str) -> Result<i64> {
        let rsp = self
            .http
            .post(self.base.join("/api/v1/posts")?)
            .json(&CreatePostRequest {
                content_text: text.to_owned(),
                content_image_path: vec![],
                visible: Some(true),
            })
            .send()
            .await?;
        assert_eq!(rsp.status(), StatusCode::OK, "create-post failed");
        let body: wandersphere_shared::api::CreatePostResponse = rsp.json().await?;
        Ok(body.post_id)
    }

    pub async fn delete_post(&self, post_id: i64) -> Result<reqwest::Response> {
        Ok(self
            .http
            .delete(self.base.join(&format!("/api/v1/posts/{}", post_id))?)
            .send()
            .await?)
    }

    pub async fn post_detail(&self, post_id: i64) -> Result<reqwest::Response> {
        Ok(self
            .http
            .get(self.base.join(&format!("/api/v1/posts/{}", post_id))?)
            .send()
            .await?)
    }

    pub async fn newsfeed(&self, page: u32, page_size: u32) -> Result<NewsfeedResponse> {
        let rsp = self
            .http
            .get(self.base.join(&format!(
                "/api/v1/newsfeed?page={}&page_size={}",
                page, page_size
            ))?)
            .send()
            .await?;
        assert_eq!(rsp.status(), StatusCode::OK, "newsfeed read failed");
        Ok(rsp.json().await?)
    }

    /// Poll this user's feed until `pred` holds (or the fan-out budget is spent)
    pub async fn await_feed<F>(&self, pred: F) -> Result<NewsfeedResponse>
    where
        F: Fn(&NewsfeedResponse) -> bool,
    {
        let deadline = std::time::Instant::now() + FANOUT_BUDGET;
        loop {
            let feed = self.newsfeed(1, 50).await?;
            if pred(&feed) {
                return Ok(feed);
            }
            if std::time::Instant::now() > deadline {
                return Err(Failed::from(format!(
                    "feed for {} never reached the expected state: {:?}",
                    self.user_name, feed.posts_ids
                )));
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }
}

/// Hit the gateway healthcheck; the cheapest possible liveness probe for the deployment under
/// test
pub async fn test_healthcheck(base: &Url) -> Result<()> {
    assert_eq!(
        "GOOD",
        reqwest::get(base.join("/healthcheck")?).await?.text().await?
    );
    Ok(())
}

/// Signup → login → session: the cookie round-trips & the profile comes back
pub async fn test_signup_and_login(base: &Url) -> Result<()> {
    let client = Client::signup_and_login(base).await?;
    // An authenticated read works at all-- the session cookie is doing its job
    let _ = client.newsfeed(1, 10).await?;
    Ok(())
}

/// A second signup under the same name is a 400 "username existed"
pub async fn test_duplicate_signup(base: &Url) -> Result<()> {
    let client = Client::signup_and_login(base).await?;
    let http = reqwest::Client::new();
    let rsp = http
        .post(base.join("/api/v1/users/signup")?)
        .json(&CreateUserRequest {
            user_name: client.user_name.clone(),
            password: "Abcd1234!".to_owned(),
            first_name: String::new(),
            last_name: String::new(),
            date_of_birth: "1990-01-01".to_owned(),
            email: "other@test.invalid".to_owned(),
        })
        .send()
        .await?;
    assert_eq!(rsp.status(), StatusCode::BAD_REQUEST);
    let body: ErrorResponse = rsp.json().await?;
    assert_eq!(body.message, "username existed");
    Ok(())
}

/// Self-follow is rejected with the canonical message & creates no edge
pub async fn test_self_follow_rejected(base: &Url) -> Result<()> {
    let alice = Client::signup_and_login(base).await?;
    let rsp = alice.follow(alice.user_id).await?;
    assert_eq!(rsp.status(), StatusCode::BAD_REQUEST);
    let body: ErrorResponse = rsp.json().await?;
    assert_eq!(body.message, "already following this user");

    let followings = alice.followings(alice.user_id).await?;
    assert!(followings.followings_ids.is_empty());
    Ok(())
}

/// Fan-out on write: bob follows alice; alice posts; the post id reaches bob's feed
pub async fn test_fan_out(base: &Url) -> Result<()> {
    let alice = Client::signup_and_login(base).await?;
    let bob = Client::signup_and_login(base).await?;

    let rsp = bob.follow(alice.user_id).await?;
    assert_eq!(rsp.status(), StatusCode::OK);

    let post_id = alice.create_post("hi").await?;
    let feed = bob.await_feed(|feed| feed.posts_ids.contains(&post_id)).await?;
    assert_eq!(
        feed.posts_ids.iter().filter(|id| **id == post_id).count(),
        1
    );
    Ok(())
}

/// Pagination: totals & page boundaries behave; reads are non-destructive
pub async fn test_pagination(base: &Url) -> Result<()> {
    let alice = Client::signup_and_login(base).await?;
    let bob = Client::signup_and_login(base).await?;
    bob.follow(alice.user_id).await?;

    let mut expected = Vec::new();
    for i in 0..5 {
        expected.push(alice.create_post(&format!("post {}", i)).await?);
    }
    bob.await_feed(|feed| expected.iter().all(|id| feed.posts_ids.contains(id)))
        .await?;

    let page1 = bob.newsfeed(1, 2).await?;
    assert_eq!(page1.posts_ids.len(), 2);
    assert_eq!(page1.current_page, 1);
    assert!(page1.total_items >= 5);

    // Idempotent: the same read again yields the same page
    let again = bob.newsfeed(1, 2).await?;
    assert_eq!(page1.posts_ids, again.posts_ids);
    assert_eq!(page1.total_items, again.total_items);
    Ok(())
}

/// Deleting a post cascades (detail 404s) & eventually sweeps it from follower feeds
pub async fn test_delete_sweeps_feeds(base: &Url) -> Result<()> {
    let alice = Client::signup_and_login(base).await?;
    let bob = Client::signup_and_login(base).await?;
    bob.follow(alice.user_id).await?;

    let post_id = alice.create_post("ephemeral").await?;
    bob.await_feed(|feed| feed.posts_ids.contains(&post_id)).await?;

    let rsp = alice.delete_post(post_id).await?;
    assert_eq!(rsp.status(), StatusCode::OK);

    let rsp = alice.post_detail(post_id).await?;
    assert_eq!(rsp.status(), StatusCode::BAD_REQUEST);

    bob.await_feed(|feed| !feed.posts_ids.contains(&post_id)).await?;
    Ok(())
}

/// A non-author's delete is refused (& maps to 401 per the compatibility table)
pub async fn test_non_author_may_not_delete(base: &Url) -> Result<()> {
    let alice = Client::signup_and_login(base).await?;
    let mallory = Client::signup_and_login(base).await?;

    let post_id = alice.create_post("mine").await?;
    let rsp = mallory.delete_post(post_id).await?;
    assert_eq!(rsp.status(), StatusCode::UNAUTHORIZED);

    let rsp: PostDetailResponse = alice.post_detail(post_id).await?.json().await?;
    assert_eq!(rsp.post_id, post_id);
    Ok(())
}
