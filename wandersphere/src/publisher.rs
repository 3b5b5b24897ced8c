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

//! # The newsfeed publisher
//!
//! Fan-out-on-write. Two distinct paths share this process:
//!
//! 1. The `PublishPost` RPC: serialize `{user_id, post_id}` & append it to the event log under
//!    key `"post"`. If the broker is unreachable after bounded retries, fall back to *inline*
//!    fan-out on the calling task-- the caller still gets an OK if that works.
//!
//! 2. The fan-out worker: a long-running task that reads records back off the log, resolves the
//!    author's followers (through a 24-hour cache, an empty list cached as a sentinel so that
//!    authors with no followers don't hammer the authoring service), and appends the post id to
//!    every follower's `newsfeed:*` list.
//!
//! Delivery is at-least-once: the worker may re-process a record after a crash, so a post id can
//! appear in a feed twice; readers tolerate that. A record whose appends exhaust their retries is
//! logged at warn & abandoned-- the loop moves on to the next record rather than wedging the
//! whole pipeline on one sick key.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::Notify,
    task::{JoinError, JoinHandle},
};
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use wandersphere_shared::ExponentialBackoffParameters;

use crate::{
    cache::{self, Backend as CacheBackend},
    client::FollowerSource,
    entities::{PostId, UserId},
    eventlog::{Log, PostRecord, Record, POST_KEY},
    metrics::{Instruments, Metric},
    rpc::protobuf,
};

type StdResult<T, E> = std::result::Result<T, E>;

/// How long one pass of the worker loop will wait for the next record; expiry is not an error,
/// the loop just comes back around (& notices shutdown)
const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the worker sleeps after a failed read before polling the broker again
const BROKER_RETRY_SLEEP: Duration = Duration::from_secs(1);

/// Retry `op` per `backoff`: up to `num_attempts` tries, sleeping between them, the sleep
/// doubling each time. Returns the last error if every attempt fails.
async fn retrying<T, E, F, Fut>(backoff: &ExponentialBackoffParameters, mut op: F) -> StdResult<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = StdResult<T, E>>,
    E: std::fmt::Display,
{
    let mut delays = backoff.delays();
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => match delays.next() {
                Some(delay) => {
                    debug!("transient failure ({}); retrying in {:?}", err, delay);
                    tokio::time::sleep(delay).await;
                }
                None => return Err(err),
            },
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          the service                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The newsfeed publishing service: the `PublishPost` ingress & the fan-out logic it shares with
/// the worker loop
pub struct PublishingService {
    log: Arc<dyn Log + Send + Sync>,
    cache: Arc<dyn CacheBackend + Send + Sync>,
    followers: Arc<dyn FollowerSource + Send + Sync>,
    backoff: ExponentialBackoffParameters,
    instruments: Arc<Instruments>,
}

impl PublishingService {
    pub fn new(
        log: Arc<dyn Log + Send + Sync>,
        cache: Arc<dyn CacheBackend + Send + Sync>,
        followers: Arc<dyn FollowerSource + Send + Sync>,
        backoff: ExponentialBackoffParameters,
        instruments: Arc<Instruments>,
    ) -> PublishingService {
        PublishingService {
            log,
            cache,
            followers,
            backoff,
            instruments,
        }
    }

    /// Resolve the followers of `user_id`, by way of the 24-hour cache
    ///
    /// On a cache miss we ask the authoring service & write the answer back, an *empty* answer
    /// included (as a single sentinel element-- a Redis list can't be empty). If the authoring
    /// service can't be reached either, degrade to an empty list & leave the cache alone so the
    /// next record retries the lookup.
    async fn resolve_followers(&self, user_id: UserId) -> Vec<UserId> {
        let key = cache::followers_key(user_id);

        match self.cache.exists(&key).await {
            Ok(true) => match self.cache.lrange(&key, 0, -1).await {
                Ok(raw) => return parse_ids(&raw),
                Err(err) => {
                    warn!("Failed to read the followers cache at {}: {}", key, err);
                }
            },
            Ok(false) => (),
            Err(err) => {
                warn!("Failed to probe the followers cache at {}: {}", key, err);
            }
        }

        let followers = match retrying(&self.backoff, || self.followers.follower_ids(user_id)).await
        {
            Ok(followers) => followers,
            Err(err) => {
                // Best-effort: the record is still consumed, this author's post just doesn't
                // fan out
                warn!(
                    "Authoring service unreachable resolving followers of {}: {}",
                    user_id, err
                );
                return vec![];
            }
        };

        let values: Vec<String> = if followers.is_empty() {
            vec![cache::EMPTY_SENTINEL.to_owned()]
        } else {
            followers.iter().map(|id| id.to_string()).collect()
        };
        if let Err(err) = self.cache.rpush(&key, &values, cache::DEFAULT_TTL).await {
            warn!("Failed to write the followers cache at {}: {}", key, err);
        }
        followers
    }

    /// Append `post_id` to the feed of every follower of `user_id`
    ///
    /// The happy path is one pipelined batch append; if that fails, each key is retried
    /// individually with exponential backoff, & keys that still fail are logged & dropped.
    pub async fn fan_out(&self, user_id: UserId, post_id: PostId) {
        let followers = self.resolve_followers(user_id).await;
        if followers.is_empty() {
            debug!("{} has no followers; nothing to fan out", user_id);
            return;
        }

        let keys: Vec<String> = followers
            .iter()
            .map(|follower| cache::newsfeed_key(*follower))
            .collect();
        let value = post_id.to_string();

        if self
            .cache
            .rpush_each(&keys, &value, cache::DEFAULT_TTL)
            .await
            .is_ok()
        {
            self.instruments
                .count(Metric::FanOutAppends, keys.len() as u64, &[]);
            return;
        }

        // The batch failed; retry each feed on its own so one sick key can't starve the rest
        for key in &keys {
            let appended = retrying(&self.backoff, || {
                self.cache
                    .rpush(key, std::slice::from_ref(&value), cache::DEFAULT_TTL)
            })
            .await;
            match appended {
                Ok(()) => self.instruments.count(Metric::FanOutAppends, 1, &[]),
                Err(err) => {
                    warn!("Abandoning append of {} to {}: {}", value, key, err);
                    self.instruments.count(Metric::FanOutAppendFailures, 1, &[]);
                }
            }
        }
    }

    /// Process one record read back from the log
    ///
    /// Unknown keys are logged & skipped (that's how new record types roll out); malformed values
    /// likewise-- at-least-once delivery means a poison record must never wedge the loop.
    pub async fn handle_record(&self, record: Record) {
        if record.key != POST_KEY {
            debug!(
                "Skipping record with unrecognized key {:?}",
                String::from_utf8_lossy(&record.key)
            );
            self.instruments.count(Metric::RecordsSkipped, 1, &[]);
            return;
        }
        let post = match PostRecord::from_json(&record.value) {
            Ok(post) => post,
            Err(err) => {
                warn!("Skipping malformed post record: {}", err);
                self.instruments.count(Metric::RecordsSkipped, 1, &[]);
                return;
            }
        };
        self.instruments.count(Metric::RecordsConsumed, 1, &[]);
        self.fan_out(UserId::new(post.user_id), PostId::new(post.post_id))
            .await;
    }
}

#[tonic::async_trait]
impl protobuf::newsfeed_publishing_server::NewsfeedPublishing for Arc<PublishingService> {
    /// Enqueue a publication event
    ///
    /// Appends one record to the log. If the broker is down even after retries, fan out inline on
    /// this task-- degraded, but the author's post still reaches their followers.
    async fn publish_post(
        &self,
        request: Request<protobuf::PublishPostRequest>,
    ) -> StdResult<Response<protobuf::PublishPostResponse>, Status> {
        use protobuf::publish_post_response::Status as RespStatus;
        let req = request.into_inner();
        let (user_id, post_id) = (UserId::new(req.user_id), PostId::new(req.post_id));

        let value = PostRecord::new(user_id, post_id)
            .to_json()
            .map_err(|err| Status::internal(err.to_string()))?;

        match retrying(&self.backoff, || self.log.append(POST_KEY, &value)).await {
            Ok(()) => (),
            Err(err) => {
                warn!(
                    "Log broker unreachable ({}); falling back to inline fan-out for post {}",
                    err, post_id
                );
                self.instruments.count(Metric::InlineFanOuts, 1, &[]);
                self.fan_out(user_id, post_id).await;
            }
        }

        Ok(Response::new(protobuf::PublishPostResponse {
            status: RespStatus::Ok as i32,
        }))
    }
}

fn parse_ids(raw: &[String]) -> Vec<UserId> {
    raw.iter()
        .filter(|s| !s.is_empty())
        .filter_map(|s| match UserId::from_decimal(s) {
            Ok(id) => Some(id),
            Err(_) => {
                warn!("Skipping malformed id {:?} in the cache", s);
                None
            }
        })
        .collect()
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       the fan-out worker                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Handle on the running fan-out worker; signal it to stop & collect the result
///
/// The worker is an independent task alongside the RPC server; on shutdown the flag flips & the
/// loop exits before the next read.
pub struct Worker {
    handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

impl Worker {
    /// Signal the worker to stop & wait up to `timeout` for it to do so
    pub async fn shutdown(self, timeout: Duration) -> StdResult<(), JoinError> {
        self.shutdown.notify_one();
        match tokio::time::timeout(timeout, self.handle).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Timed-out waiting for the fan-out worker; abandoning it");
                Ok(())
            }
        }
    }
    /// Split the instance back into its parts; convenient when waiting on the worker along with
    /// other futures in a `tokio::select!`
    pub fn into_parts(self) -> (JoinHandle<()>, Arc<Notify>) {
        (self.handle, self.shutdown)
    }
}

/// Spawn the fan-out worker
pub fn spawn_worker(svc: Arc<PublishingService>) -> Worker {
    let shutdown = Arc::new(Notify::new());
    let handle = tokio::spawn(process(svc, shutdown.clone()));
    Worker { handle, shutdown }
}

async fn process(svc: Arc<PublishingService>, shutdown: Arc<Notify>) {
    info!("Fan-out worker starting.");
    let mut running = true;
    while running {
        tokio::select! {
            _ = shutdown.notified() => {
                running = false;
            },
            result = svc.log.read(READ_TIMEOUT) => match result {
                // A timeout is not an error; just come back around
                Ok(None) => (),
                Ok(Some(record)) => svc.handle_record(record).await,
                Err(err) => {
                    // Broker trouble; nap & poll for recovery
                    warn!("Log read failed ({}); sleeping before retrying.", err);
                    tokio::select! {
                        _ = shutdown.notified() => { running = false; },
                        _ = tokio::time::sleep(BROKER_RETRY_SLEEP) => (),
                    }
                }
            },
        }
    }
    info!("Fan-out worker exiting.");
}

#[cfg(test)]
mod test {
    use super::*;

    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Mutex,
        },
    };

    use async_trait::async_trait;

    use crate::{cache::MemoryStore, client, eventlog};

    struct MockLog {
        records: Mutex<VecDeque<Record>>,
        fail_append: AtomicBool,
    }

    impl MockLog {
        fn new() -> MockLog {
            MockLog {
                records: Mutex::new(VecDeque::new()),
                fail_append: AtomicBool::new(false),
            }
        }
        fn push(&self, key: &[u8], value: &[u8]) {
            self.records.lock().unwrap().push_back(Record {
                key: key.to_vec(),
                value: value.to_vec(),
            });
        }
    }

    #[async_trait]
    impl Log for MockLog {
        async fn append(&self, key: &[u8], value: &[u8]) -> eventlog::Result<()> {
            if self.fail_append.load(Ordering::SeqCst) {
                return Err(eventlog::Error::Write {
                    source: rdkafka::error::KafkaError::Canceled,
                    backtrace: snafu::Backtrace::capture(),
                });
            }
            self.push(key, value);
            Ok(())
        }
        async fn read(&self, wait: Duration) -> eventlog::Result<Option<Record>> {
            let popped = self.records.lock().unwrap().pop_front();
            match popped {
                Some(record) => Ok(Some(record)),
                None => {
                    tokio::time::sleep(wait).await;
                    Ok(None)
                }
            }
        }
    }

    struct MockFollowers {
        followers: Vec<UserId>,
        fail: bool,
        calls: AtomicUsize,
    }

    impl MockFollowers {
        fn of(ids: &[i64]) -> MockFollowers {
            MockFollowers {
                followers: ids.iter().map(|id| UserId::new(*id)).collect(),
                fail: false,
                calls: AtomicUsize::new(0),
            }
        }
        fn unreachable() -> MockFollowers {
            MockFollowers {
                followers: vec![],
                fail: true,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl FollowerSource for MockFollowers {
        async fn follower_ids(&self, _user_id: UserId) -> client::Result<Vec<UserId>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(client::Error::NoHosts {
                    service: "authpost",
                    backtrace: snafu::Backtrace::capture(),
                });
            }
            Ok(self.followers.clone())
        }
    }

    struct Fixture {
        svc: Arc<PublishingService>,
        log: Arc<MockLog>,
        cache: Arc<MemoryStore>,
        followers: Arc<MockFollowers>,
    }

    fn fixture(followers: MockFollowers) -> Fixture {
        let log = Arc::new(MockLog::new());
        let cache = Arc::new(MemoryStore::new());
        let followers = Arc::new(followers);
        let svc = Arc::new(PublishingService::new(
            log.clone(),
            cache.clone(),
            followers.clone(),
            ExponentialBackoffParameters::default(),
            Arc::new(Instruments::new("wandersphere")),
        ));
        Fixture {
            svc,
            log,
            cache,
            followers,
        }
    }

    // After fan-out, every follower's feed contains the post id, in publication order.
    #[tokio::test]
    async fn fan_out_appends_to_every_follower() {
        let fx = fixture(MockFollowers::of(&[2, 3]));
        fx.svc.fan_out(UserId::new(1), PostId::new(7)).await;
        fx.svc.fan_out(UserId::new(1), PostId::new(8)).await;

        for follower in [2, 3] {
            let feed = fx
                .cache
                .lrange(&cache::newsfeed_key(UserId::new(follower)), 0, -1)
                .await
                .unwrap();
            assert_eq!(feed, vec!["7".to_owned(), "8".to_owned()]);
        }
        // The followers cache saved the second lookup
        assert_eq!(fx.followers.calls.load(Ordering::SeqCst), 1);
    }

    // An author with no followers is cached as such-- the sentinel keeps the worker from
    // re-calling the authoring service on every one of their posts.
    #[tokio::test]
    async fn empty_follower_lists_are_cached() {
        let fx = fixture(MockFollowers::of(&[]));
        fx.svc.fan_out(UserId::new(1), PostId::new(7)).await;
        fx.svc.fan_out(UserId::new(1), PostId::new(8)).await;
        assert_eq!(fx.followers.calls.load(Ordering::SeqCst), 1);
        assert!(fx
            .cache
            .exists(&cache::followers_key(UserId::new(1)))
            .await
            .unwrap());
    }

    // A warm cache means the authoring service is never consulted.
    #[tokio::test]
    async fn warm_cache_short_circuits_the_lookup() {
        let fx = fixture(MockFollowers::unreachable());
        fx.cache
            .rpush(
                &cache::followers_key(UserId::new(1)),
                &["2".to_owned()],
                cache::DEFAULT_TTL,
            )
            .await
            .unwrap();
        fx.svc.fan_out(UserId::new(1), PostId::new(7)).await;
        assert_eq!(fx.followers.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            fx.cache
                .lrange(&cache::newsfeed_key(UserId::new(2)), 0, -1)
                .await
                .unwrap(),
            vec!["7".to_owned()]
        );
    }

    // With the authoring service down, the record is consumed best-effort: nothing fans out &
    // nothing is cached (the next record retries the lookup).
    #[tokio::test(start_paused = true)]
    async fn unreachable_authoring_service_degrades_to_empty() {
        let fx = fixture(MockFollowers::unreachable());
        fx.svc.fan_out(UserId::new(1), PostId::new(7)).await;
        assert!(!fx
            .cache
            .exists(&cache::followers_key(UserId::new(1)))
            .await
            .unwrap());
        // 3 attempts per the default backoff
        assert_eq!(fx.followers.calls.load(Ordering::SeqCst), 3);
        fx.svc.fan_out(UserId::new(1), PostId::new(8)).await;
        assert_eq!(fx.followers.calls.load(Ordering::SeqCst), 6);
    }

    // Broker down: PublishPost still returns OK, by fanning out inline.
    #[tokio::test(start_paused = true)]
    async fn publish_falls_back_to_inline_fan_out() {
        use crate::rpc::protobuf::newsfeed_publishing_server::NewsfeedPublishing;

        let fx = fixture(MockFollowers::of(&[2]));
        fx.log.fail_append.store(true, Ordering::SeqCst);

        let rsp = fx
            .svc
            .publish_post(Request::new(protobuf::PublishPostRequest {
                user_id: 1,
                post_id: 9,
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(
            rsp.status,
            protobuf::publish_post_response::Status::Ok as i32
        );
        assert_eq!(
            fx.cache
                .lrange(&cache::newsfeed_key(UserId::new(2)), 0, -1)
                .await
                .unwrap(),
            vec!["9".to_owned()]
        );
    }

    // The healthy path: PublishPost appends to the log, the worker consumes & fans out.
    #[tokio::test]
    async fn worker_consumes_published_records() {
        use crate::rpc::protobuf::newsfeed_publishing_server::NewsfeedPublishing;

        let fx = fixture(MockFollowers::of(&[2]));
        let worker = spawn_worker(fx.svc.clone());

        fx.svc
            .publish_post(Request::new(protobuf::PublishPostRequest {
                user_id: 1,
                post_id: 11,
            }))
            .await
            .unwrap();
        fx.svc
            .publish_post(Request::new(protobuf::PublishPostRequest {
                user_id: 1,
                post_id: 12,
            }))
            .await
            .unwrap();

        // Wait for the worker to drain the log
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let len = fx
                .cache
                .llen(&cache::newsfeed_key(UserId::new(2)))
                .await
                .unwrap();
            if len == 2 || tokio::time::Instant::now() > deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            fx.cache
                .lrange(&cache::newsfeed_key(UserId::new(2)), 0, -1)
                .await
                .unwrap(),
            vec!["11".to_owned(), "12".to_owned()]
        );

        worker.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    // Unknown record keys & malformed values are skipped, not fatal.
    #[tokio::test]
    async fn poison_records_are_skipped() {
        let fx = fixture(MockFollowers::of(&[2]));
        fx.svc
            .handle_record(Record {
                key: b"unrecognized".to_vec(),
                value: b"{}".to_vec(),
            })
            .await;
        fx.svc
            .handle_record(Record {
                key: POST_KEY.to_vec(),
                value: b"this is not json".to_vec(),
            })
            .await;
        assert_eq!(fx.followers.calls.load(Ordering::SeqCst), 0);

        // And a good record afterwards still works
        fx.svc
            .handle_record(Record {
                key: POST_KEY.to_vec(),
                value: PostRecord::new(UserId::new(1), PostId::new(7))
                    .to_json()
                    .unwrap(),
            })
            .await;
        assert_eq!(
            fx.cache
                .lrange(&cache::newsfeed_key(UserId::new(2)), 0, -1)
                .await
                .unwrap(),
            vec!["7".to_owned()]
        );
    }

    // Malformed ids in a cached followers list are skipped with a log line.
    #[tokio::test]
    async fn malformed_cached_ids_are_skipped() {
        let fx = fixture(MockFollowers::unreachable());
        fx.cache
            .rpush(
                &cache::followers_key(UserId::new(1)),
                &["2".to_owned(), "bogus".to_owned(), "3".to_owned()],
                cache::DEFAULT_TTL,
            )
            .await
            .unwrap();
        fx.svc.fan_out(UserId::new(1), PostId::new(7)).await;
        for follower in [2, 3] {
            assert_eq!(
                fx.cache
                    .llen(&cache::newsfeed_key(UserId::new(follower)))
                    .await
                    .unwrap(),
                1
            );
        }
    }
}
