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

//! # cache
//!
//! The key-value store underneath sessions, the followers cache & the per-user newsfeed lists.
//!
//! Application code writes to the object-safe [Backend] trait; at startup a particular
//! implementation is chosen: [RedisStore] ordinarily, or the in-process [MemoryStore] when the
//! external store can't be reached (degraded mode-- the feeds it accumulates are lost on restart
//! and are *not* reconciled back into the external store on recovery).
//!
//! Key formats, all carrying a 24-hour default TTL:
//!
//! - `session:<uuid>` → owner user id, as a decimal string
//! - `followers:<user_id>` → list of follower user ids, decimal strings
//! - `newsfeed:<user_id>` → list of post ids, decimal strings, append order = publication order

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use redis::AsyncCommands;
use snafu::{prelude::*, Backtrace};
use tokio::sync::RwLock;
use tracing::warn;

use crate::entities::UserId;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Redis error: {source}"))]
    Redis {
        source: redis::RedisError,
        backtrace: Backtrace,
    },
    #[snafu(display("Timed-out connecting to the key-value store"))]
    ConnectTimeout { backtrace: Backtrace },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        keys & constants                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Default TTL applied to sessions, the followers cache & newsfeed lists
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Batch size for cursor-based scans (the post-deletion sweep)
pub const SCAN_BATCH: u64 = 10;

/// A cached *empty* followers list is one containing only this value; without it, a key-miss and
/// "no followers" would be indistinguishable & authors with no followers would hammer the
/// authoring service on every post.
pub const EMPTY_SENTINEL: &str = "";

pub fn session_key(session_id: &str) -> String {
    format!("session:{}", session_id)
}

pub fn followers_key(user_id: UserId) -> String {
    format!("followers:{}", user_id)
}

pub fn newsfeed_key(user_id: UserId) -> String {
    format!("newsfeed:{}", user_id)
}

pub const NEWSFEED_KEY_PATTERN: &str = "newsfeed:*";

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          the Backend                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Object-safe trait abstracting over the key-value store
///
/// The surface is the handful of string, list & keyspace operations wandersphere actually uses.
/// List reads are non-destructive by design: the newsfeed reader must be able to serve the same
/// page twice.
#[async_trait]
pub trait Backend {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    async fn del(&self, key: &str) -> Result<()>;
    /// Reset `key`'s TTL; a no-op if the key is gone
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;
    async fn exists(&self, key: &str) -> Result<bool>;
    /// Append `values` to the list at `key` & reset its TTL
    async fn rpush(&self, key: &str, values: &[String], ttl: Duration) -> Result<()>;
    /// Append `value` to *each* of `keys` in one round-trip (pipelined on Redis). All-or-nothing:
    /// on failure the caller retries keys individually.
    async fn rpush_each(&self, keys: &[String], value: &str, ttl: Duration) -> Result<()>;
    /// Inclusive range, Redis conventions (negative indices count from the tail)
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;
    async fn llen(&self, key: &str) -> Result<u64>;
    /// Remove every occurrence of `value` from the list at `key`; return the number removed
    async fn lrem(&self, key: &str, value: &str) -> Result<u64>;
    /// One step of a cursor-based scan over keys matching `pattern`; a returned cursor of zero
    /// means the iteration is complete
    async fn scan(&self, pattern: &str, cursor: u64, count: u64) -> Result<(u64, Vec<String>)>;
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           RedisStore                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// [Backend] implementation talking to an external Redis (or protocol-compatible) server
pub struct RedisStore {
    manager: redis::aio::ConnectionManager,
}

impl RedisStore {
    /// Connect & verify the connection with a PING
    pub async fn new(address: &str, password: Option<&str>, db: i64) -> Result<RedisStore> {
        let url = match password {
            Some(password) => format!("redis://:{}@{}/{}", password, address, db),
            None => format!("redis://{}/{}", address, db),
        };
        let client = redis::Client::open(url).context(RedisSnafu)?;
        let mut manager = redis::aio::ConnectionManager::new(client)
            .await
            .context(RedisSnafu)?;
        redis::cmd("PING")
            .query_async::<()>(&mut manager)
            .await
            .context(RedisSnafu)?;
        Ok(RedisStore { manager })
    }
}

#[async_trait]
impl Backend for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        conn.get(key).await.context(RedisSnafu)
    }
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.set_ex(key, value, ttl.as_secs()).await.context(RedisSnafu)
    }
    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.del(key).await.context(RedisSnafu)
    }
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.expire(key, ttl.as_secs() as i64).await.context(RedisSnafu)
    }
    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        conn.exists(key).await.context(RedisSnafu)
    }
    async fn rpush(&self, key: &str, values: &[String], ttl: Duration) -> Result<()> {
        let mut conn = self.manager.clone();
        redis::pipe()
            .rpush(key, values)
            .ignore()
            .expire(key, ttl.as_secs() as i64)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .context(RedisSnafu)
    }
    async fn rpush_each(&self, keys: &[String], value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.manager.clone();
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.rpush(key, value)
                .ignore()
                .expire(key, ttl.as_secs() as i64)
                .ignore();
        }
        pipe.query_async::<()>(&mut conn).await.context(RedisSnafu)
    }
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let mut conn = self.manager.clone();
        conn.lrange(key, start as isize, stop as isize)
            .await
            .context(RedisSnafu)
    }
    async fn llen(&self, key: &str) -> Result<u64> {
        let mut conn = self.manager.clone();
        conn.llen(key).await.context(RedisSnafu)
    }
    async fn lrem(&self, key: &str, value: &str) -> Result<u64> {
        let mut conn = self.manager.clone();
        conn.lrem(key, 0, value).await.context(RedisSnafu)
    }
    async fn scan(&self, pattern: &str, cursor: u64, count: u64) -> Result<(u64, Vec<String>)> {
        let mut conn = self.manager.clone();
        redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .context(RedisSnafu)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           MemoryStore                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

type Deadline = tokio::time::Instant;

#[derive(Default)]
struct MemoryInner {
    strings: HashMap<String, (String, Deadline)>,
    lists: HashMap<String, (Vec<String>, Deadline)>,
}

impl MemoryInner {
    // Expiry is enforced lazily: an expired entry is dropped the next time anyone looks at it.
    fn prune(&mut self) {
        let now = Deadline::now();
        self.strings.retain(|_, (_, deadline)| *deadline > now);
        self.lists.retain(|_, (_, deadline)| *deadline > now);
    }
}

/// In-process [Backend] with the same `followers`/`newsfeed`/`session` semantics as [RedisStore],
/// but no persistence
///
/// This is the degraded-mode fallback for a key-value store that's unreachable at startup.
/// Guarded by a single reader-writer lock; writers take the writer lock, readers the reader lock
/// (except where expiry forces a prune).
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }
}

// Only the pattern shapes wandersphere actually scans with ("newsfeed:*") need to match.
fn glob_match(pattern: &str, key: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}

#[async_trait]
impl Backend for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.inner.write().await;
        inner.prune();
        Ok(inner.strings.get(key).map(|(value, _)| value.clone()))
    }
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .strings
            .insert(key.to_owned(), (value.to_owned(), Deadline::now() + ttl));
        Ok(())
    }
    async fn del(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.strings.remove(key);
        inner.lists.remove(key);
        Ok(())
    }
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.prune();
        let deadline = Deadline::now() + ttl;
        if let Some((_, d)) = inner.strings.get_mut(key) {
            *d = deadline;
        }
        if let Some((_, d)) = inner.lists.get_mut(key) {
            *d = deadline;
        }
        Ok(())
    }
    async fn exists(&self, key: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        inner.prune();
        Ok(inner.strings.contains_key(key) || inner.lists.contains_key(key))
    }
    async fn rpush(&self, key: &str, values: &[String], ttl: Duration) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.prune();
        let deadline = Deadline::now() + ttl;
        let entry = inner
            .lists
            .entry(key.to_owned())
            .or_insert_with(|| (Vec::new(), deadline));
        entry.0.extend(values.iter().cloned());
        entry.1 = deadline;
        Ok(())
    }
    async fn rpush_each(&self, keys: &[String], value: &str, ttl: Duration) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.prune();
        let deadline = Deadline::now() + ttl;
        for key in keys {
            let entry = inner
                .lists
                .entry(key.clone())
                .or_insert_with(|| (Vec::new(), deadline));
            entry.0.push(value.to_owned());
            entry.1 = deadline;
        }
        Ok(())
    }
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let mut inner = self.inner.write().await;
        inner.prune();
        let Some((list, _)) = inner.lists.get(key) else {
            return Ok(Vec::new());
        };
        let len = list.len() as i64;
        let clamp = |i: i64| -> i64 {
            if i < 0 {
                (len + i).max(0)
            } else {
                i.min(len)
            }
        };
        let (start, stop) = (clamp(start), clamp(stop));
        if start >= len || stop < start {
            return Ok(Vec::new());
        }
        let stop = stop.min(len - 1);
        Ok(list[start as usize..=stop as usize].to_vec())
    }
    async fn llen(&self, key: &str) -> Result<u64> {
        let mut inner = self.inner.write().await;
        inner.prune();
        Ok(inner.lists.get(key).map(|(l, _)| l.len() as u64).unwrap_or(0))
    }
    async fn lrem(&self, key: &str, value: &str) -> Result<u64> {
        let mut inner = self.inner.write().await;
        inner.prune();
        let Some((list, _)) = inner.lists.get_mut(key) else {
            return Ok(0);
        };
        let before = list.len();
        list.retain(|x| x != value);
        let removed = (before - list.len()) as u64;
        if list.is_empty() {
            inner.lists.remove(key);
        }
        Ok(removed)
    }
    async fn scan(&self, pattern: &str, cursor: u64, count: u64) -> Result<(u64, Vec<String>)> {
        let mut inner = self.inner.write().await;
        inner.prune();
        let mut keys: Vec<String> = inner
            .strings
            .keys()
            .chain(inner.lists.keys())
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        let start = cursor as usize;
        if start >= keys.len() {
            return Ok((0, Vec::new()));
        }
        let stop = (start + count as usize).min(keys.len());
        let next = if stop == keys.len() { 0 } else { stop as u64 };
        Ok((next, keys[start..stop].to_vec()))
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        store selection                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Produce a [Backend] for the configured key-value store, falling back to an in-process
/// [MemoryStore] if it can't be reached promptly
///
/// The fallback is chosen once, at startup; on recovery of the external store the in-memory state
/// is not reconciled into it.
pub async fn select_store(
    address: &str,
    password: Option<&str>,
    db: i64,
    connect_timeout: Duration,
) -> std::sync::Arc<dyn Backend + Send + Sync> {
    match tokio::time::timeout(connect_timeout, RedisStore::new(address, password, db)).await {
        Ok(Ok(store)) => std::sync::Arc::new(store),
        Ok(Err(err)) => {
            warn!(
                "Key-value store at {} is unreachable ({}); falling back to the in-process store.",
                address, err
            );
            std::sync::Arc::new(MemoryStore::new())
        }
        Err(_) => {
            warn!(
                "Timed-out connecting to the key-value store at {}; falling back to the in-process store.",
                address
            );
            std::sync::Arc::new(MemoryStore::new())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn strings_and_ttl() {
        tokio::time::pause();
        let store = MemoryStore::new();
        store
            .set("session:abc", "42", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get("session:abc").await.unwrap().as_deref(), Some("42"));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(store.get("session:abc").await.unwrap(), None);
        assert!(!store.exists("session:abc").await.unwrap());
    }

    #[tokio::test]
    async fn expire_extends() {
        tokio::time::pause();
        let store = MemoryStore::new();
        store
            .set("session:abc", "42", Duration::from_secs(60))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(45)).await;
        store
            .expire("session:abc", Duration::from_secs(60))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(45)).await;
        assert_eq!(store.get("session:abc").await.unwrap().as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn lists() {
        let store = MemoryStore::new();
        let values: Vec<String> = ["11", "12", "13", "14", "15"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        store
            .rpush("newsfeed:2", &values, DEFAULT_TTL)
            .await
            .unwrap();
        assert_eq!(store.llen("newsfeed:2").await.unwrap(), 5);
        // Reads are non-destructive
        assert_eq!(
            store.lrange("newsfeed:2", 0, 1).await.unwrap(),
            vec!["11".to_owned(), "12".to_owned()]
        );
        assert_eq!(store.llen("newsfeed:2").await.unwrap(), 5);
        // Redis conventions at the edges
        assert_eq!(
            store.lrange("newsfeed:2", 4, 5).await.unwrap(),
            vec!["15".to_owned()]
        );
        assert_eq!(store.lrange("newsfeed:2", 0, -1).await.unwrap(), values);
        assert!(store.lrange("newsfeed:2", 5, 6).await.unwrap().is_empty());
        assert!(store.lrange("no-such-key", 0, -1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lrem_removes_all_occurrences() {
        let store = MemoryStore::new();
        let values: Vec<String> = ["7", "8", "7"].iter().map(|s| s.to_string()).collect();
        store.rpush("newsfeed:3", &values, DEFAULT_TTL).await.unwrap();
        assert_eq!(store.lrem("newsfeed:3", "7").await.unwrap(), 2);
        assert_eq!(
            store.lrange("newsfeed:3", 0, -1).await.unwrap(),
            vec!["8".to_owned()]
        );
        assert_eq!(store.lrem("newsfeed:3", "9").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rpush_each_appends_to_every_key() {
        let store = MemoryStore::new();
        let keys = vec!["newsfeed:1".to_owned(), "newsfeed:2".to_owned()];
        store.rpush_each(&keys, "99", DEFAULT_TTL).await.unwrap();
        for key in &keys {
            assert_eq!(
                store.lrange(key, 0, -1).await.unwrap(),
                vec!["99".to_owned()]
            );
        }
    }

    #[tokio::test]
    async fn scan_pages_through_matches() {
        let store = MemoryStore::new();
        for i in 0..25 {
            store
                .rpush(
                    &format!("newsfeed:{}", i),
                    &["1".to_owned()],
                    DEFAULT_TTL,
                )
                .await
                .unwrap();
        }
        store
            .set("session:zzz", "1", DEFAULT_TTL)
            .await
            .unwrap();

        let mut seen = Vec::new();
        let mut cursor = 0u64;
        loop {
            let (next, keys) = store.scan(NEWSFEED_KEY_PATTERN, cursor, SCAN_BATCH).await.unwrap();
            assert!(keys.len() <= SCAN_BATCH as usize);
            seen.extend(keys);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        assert_eq!(seen.len(), 25);
        assert!(seen.iter().all(|k| k.starts_with("newsfeed:")));
    }
}
