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

//! # wandersphere sessions
//!
//! Server-side sessions: an opaque UUID in a cookie, bound to a user id in the key-value store
//! under `session:<uuid>` with a sliding TTL.
//!
//! Why server-side state rather than signed tokens? Because logout & TTL refresh become trivial
//! key operations. Anyone wanting a stateless variant has to re-derive all of these semantics
//! from scratch.
//!
//! The session TTL refresh & the session read are not strictly serialized: a read near expiry can
//! race the refresh & lose. That's accepted-- the user logs in again.

use std::{sync::Arc, time::Duration};

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use snafu::{prelude::*, Backtrace};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    cache::{self, Backend as CacheBackend},
    entities::UserId,
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Key-value store failure: {source}"))]
    Cache {
        source: cache::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         configuration                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

impl std::fmt::Display for SameSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                SameSite::Strict => "Strict",
                SameSite::Lax => "Lax",
                SameSite::None => "None",
            }
        )
    }
}

/// Session parameters, straight from configuration
#[derive(Clone, Debug, Deserialize)]
pub struct SessionConfig {
    pub cookie_name: String,
    #[serde(rename = "expiration_minutes")]
    pub expiration_minutes: u64,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: SameSite,
}

impl SessionConfig {
    pub fn lifetime(&self) -> Duration {
        Duration::from_secs(self.expiration_minutes * 60)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            cookie_name: "session_id".to_owned(),
            expiration_minutes: 24 * 60,
            secure: true,
            http_only: true,
            same_site: SameSite::Strict,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            cookies                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Build a `Set-Cookie` value establishing (or refreshing) the session cookie
pub fn build_cookie(config: &SessionConfig, session_id: &str) -> String {
    build_cookie_with_max_age(config, session_id, config.lifetime().as_secs() as i64)
}

/// Build a `Set-Cookie` value clearing the session cookie
pub fn clear_cookie(config: &SessionConfig) -> String {
    build_cookie_with_max_age(config, "", 0)
}

fn build_cookie_with_max_age(config: &SessionConfig, value: &str, max_age: i64) -> String {
    let mut cookie = format!(
        "{}={}; Max-Age={}; Path=/; SameSite={}",
        config.cookie_name, value, max_age, config.same_site
    );
    if config.secure {
        cookie.push_str("; Secure");
    }
    if config.http_only {
        cookie.push_str("; HttpOnly");
    }
    cookie
}

/// Dig the session id out of the request's `Cookie` headers, if it's there
pub fn session_id_from_headers(config: &SessionConfig, headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(axum::http::header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == config.cookie_name)
        .map(|(_, value)| value.to_owned())
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        session lifecycle                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An authenticated caller, as established by the session middleware
#[derive(Clone, Debug)]
pub struct AuthedUser {
    pub session_id: String,
    pub user_id: UserId,
}

/// Mint a fresh session for `user_id`; returns the opaque session id
pub async fn mint(
    cache: &(dyn CacheBackend + Send + Sync),
    config: &SessionConfig,
    user_id: UserId,
) -> Result<String> {
    let session_id = Uuid::new_v4().to_string();
    cache
        .set(
            &cache::session_key(&session_id),
            &user_id.to_string(),
            config.lifetime(),
        )
        .await
        .context(CacheSnafu)?;
    debug!("Minted a session for user {}", user_id);
    Ok(session_id)
}

/// Resolve the request's session cookie to a user id
///
/// `None` covers every unauthenticated case: no cookie, an expired or revoked session, or a
/// malformed stored value (which also gets logged-- that one's suspicious).
pub async fn lookup(
    cache: &(dyn CacheBackend + Send + Sync),
    config: &SessionConfig,
    headers: &HeaderMap,
) -> Result<Option<AuthedUser>> {
    let Some(session_id) = session_id_from_headers(config, headers) else {
        return Ok(None);
    };
    let Some(value) = cache
        .get(&cache::session_key(&session_id))
        .await
        .context(CacheSnafu)?
    else {
        return Ok(None);
    };
    match UserId::from_decimal(&value) {
        Ok(user_id) => Ok(Some(AuthedUser {
            session_id,
            user_id,
        })),
        Err(_) => {
            warn!("Session {} holds a malformed user id {:?}", session_id, value);
            Ok(None)
        }
    }
}

/// Slide the session's expiration window out
pub async fn refresh(
    cache: &(dyn CacheBackend + Send + Sync),
    config: &SessionConfig,
    session_id: &str,
) -> Result<()> {
    cache
        .expire(&cache::session_key(session_id), config.lifetime())
        .await
        .context(CacheSnafu)
}

/// Destroy the session outright (logout)
pub async fn revoke(
    cache: &(dyn CacheBackend + Send + Sync),
    session_id: &str,
) -> Result<()> {
    cache
        .del(&cache::session_key(session_id))
        .await
        .context(CacheSnafu)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           middleware                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Session middleware: resolve the cookie, stash the [AuthedUser] in the request's extensions,
/// & slide the session's expiry on the way out (re-issuing the cookie with a fresh Max-Age)
///
/// Authentication *failures* don't stop the request here; endpoints that require a session notice
/// the missing extension & 401 themselves (public endpoints just don't care).
pub async fn middleware(
    axum::extract::State(state): axum::extract::State<Arc<crate::gateway::Gateway>>,
    headers: HeaderMap,
    mut request: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let authed = match lookup(state.cache.as_ref(), &state.session, &headers).await {
        Ok(authed) => authed,
        Err(err) => {
            warn!("Failed to resolve a session: {}", err);
            None
        }
    };

    let mut response = match authed.clone() {
        Some(user) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        None => next.run(request).await,
    };

    // Sliding expiration: any authenticated request pushes the deadline out & re-issues the
    // cookie with the full lifetime
    if let Some(user) = authed {
        if let Err(err) = refresh(state.cache.as_ref(), &state.session, &user.session_id).await {
            warn!("Failed to refresh session {}: {}", user.session_id, err);
        }
        if let Ok(value) =
            axum::http::HeaderValue::from_str(&build_cookie(&state.session, &user.session_id))
        {
            response
                .headers_mut()
                .append(axum::http::header::SET_COOKIE, value);
        }
    }

    response
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::cache::MemoryStore;

    fn headers_with_cookie(cookie: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::COOKIE,
            axum::http::HeaderValue::from_str(cookie).unwrap(),
        );
        headers
    }

    #[test]
    fn cookie_attributes() {
        let config = SessionConfig::default();
        let cookie = build_cookie(&config, "abc123");
        assert!(cookie.starts_with("session_id=abc123; "));
        assert!(cookie.contains("Max-Age=86400"));
        assert!(cookie.contains("Path=/"));
        assert!(cookie.contains("SameSite=Strict"));
        assert!(cookie.contains("Secure"));
        assert!(cookie.contains("HttpOnly"));

        let cleared = clear_cookie(&config);
        assert!(cleared.starts_with("session_id=; Max-Age=0"));

        let lax = SessionConfig {
            secure: false,
            http_only: false,
            same_site: SameSite::Lax,
            ..SessionConfig::default()
        };
        let cookie = build_cookie(&lax, "abc123");
        assert!(cookie.contains("SameSite=Lax"));
        assert!(!cookie.contains("Secure"));
        assert!(!cookie.contains("HttpOnly"));
    }

    #[test]
    fn cookie_parsing() {
        let config = SessionConfig::default();
        assert_eq!(
            session_id_from_headers(
                &config,
                &headers_with_cookie("theme=dark; session_id=abc123; lang=en")
            )
            .as_deref(),
            Some("abc123")
        );
        assert_eq!(
            session_id_from_headers(&config, &headers_with_cookie("theme=dark")),
            None
        );
        assert_eq!(session_id_from_headers(&config, &HeaderMap::new()), None);
    }

    // Within its TTL a session resolves to the user id login stored; after revocation or expiry,
    // it doesn't.
    #[tokio::test]
    async fn session_lifecycle() {
        tokio::time::pause();
        let store = MemoryStore::new();
        let config = SessionConfig::default();

        let session_id = mint(&store, &config, UserId::new(42)).await.unwrap();
        let headers = headers_with_cookie(&format!("session_id={}", session_id));

        let authed = lookup(&store, &config, &headers).await.unwrap().unwrap();
        assert_eq!(authed.user_id, UserId::new(42));
        assert_eq!(authed.session_id, session_id);

        // Refresh slides the window
        tokio::time::advance(Duration::from_secs(23 * 60 * 60)).await;
        refresh(&store, &config, &session_id).await.unwrap();
        tokio::time::advance(Duration::from_secs(23 * 60 * 60)).await;
        assert!(lookup(&store, &config, &headers).await.unwrap().is_some());

        // Logout destroys it
        revoke(&store, &session_id).await.unwrap();
        assert!(lookup(&store, &config, &headers).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_sessions_do_not_resolve() {
        tokio::time::pause();
        let store = MemoryStore::new();
        let config = SessionConfig::default();
        let session_id = mint(&store, &config, UserId::new(42)).await.unwrap();
        let headers = headers_with_cookie(&format!("session_id={}", session_id));

        tokio::time::advance(Duration::from_secs(24 * 60 * 60 + 1)).await;
        assert!(lookup(&store, &config, &headers).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_session_values_do_not_resolve() {
        let store = MemoryStore::new();
        let config = SessionConfig::default();
        store
            .set("session:abc", "not-a-number", Duration::from_secs(60))
            .await
            .unwrap();
        let headers = headers_with_cookie("session_id=abc");
        assert!(lookup(&store, &config, &headers).await.unwrap().is_none());
    }
}
