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

//! # The newsfeed reader
//!
//! Paginated, non-destructive reads over the per-user feed lists, plus the cross-feed sweep that
//! runs when a post is deleted.
//!
//! Feeds are materializations with no authoritative backing store: if a `newsfeed:*` key is lost
//! (TTL expiry, store restart), it rebuilds lazily from *subsequent* posts only. That's the
//! documented consequence of fan-out-on-write, not a bug to paper over here.

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{info, warn};

use crate::{
    cache::{self, Backend as CacheBackend},
    entities::PostId,
    metrics::{Instruments, Metric},
    rpc::protobuf,
};

type StdResult<T, E> = std::result::Result<T, E>;

/// Page-size bounds; requests outside them are clamped, not rejected
pub const DEFAULT_PAGE_SIZE: u32 = 10;
pub const MAX_PAGE_SIZE: u32 = 50;

/// The newsfeed reading service
pub struct NewsfeedService {
    cache: Arc<dyn CacheBackend + Send + Sync>,
    instruments: Arc<Instruments>,
}

impl NewsfeedService {
    pub fn new(
        cache: Arc<dyn CacheBackend + Send + Sync>,
        instruments: Arc<Instruments>,
    ) -> NewsfeedService {
        NewsfeedService { cache, instruments }
    }
}

fn empty_response() -> protobuf::GetNewsfeedResponse {
    protobuf::GetNewsfeedResponse {
        status: protobuf::get_newsfeed_response::Status::NewsfeedEmpty as i32,
        posts_ids: vec![],
        current_page: 0,
        total_pages: 0,
        total_items: 0,
    }
}

fn cache_to_status(err: cache::Error) -> Status {
    warn!("key-value store failure: {}", err);
    Status::unavailable("key-value store failure")
}

#[tonic::async_trait]
impl protobuf::newsfeed_server::Newsfeed for NewsfeedService {
    /// Serve one page of a user's feed
    ///
    /// The read is a range read, *not* a pop: preserving the feed across reads is a correctness
    /// requirement (two successive reads with no intervening writes return identical pages). The
    /// key's TTL is refreshed afterwards.
    async fn get_newsfeed(
        &self,
        request: Request<protobuf::GetNewsfeedRequest>,
    ) -> StdResult<Response<protobuf::GetNewsfeedResponse>, Status> {
        use protobuf::get_newsfeed_response::Status as RespStatus;
        let req = request.into_inner();

        if req.user_id <= 0 {
            return Ok(Response::new(empty_response()));
        }
        let page = req.page.max(1);
        let page_size = match req.page_size {
            0 => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        };

        let key = cache::newsfeed_key(crate::entities::UserId::new(req.user_id));
        if !self.cache.exists(&key).await.map_err(cache_to_status)? {
            self.instruments.count(Metric::FeedReadsEmpty, 1, &[]);
            return Ok(Response::new(empty_response()));
        }

        let total_items = self.cache.llen(&key).await.map_err(cache_to_status)?;
        let total_pages = total_items.div_ceil(page_size as u64) as u32;
        let offset = (page as u64 - 1) * page_size as u64;
        let raw = self
            .cache
            .lrange(&key, offset as i64, (offset + page_size as u64) as i64 - 1)
            .await
            .map_err(cache_to_status)?;

        // Keep the feed warm now that someone's reading it
        if let Err(err) = self.cache.expire(&key, cache::DEFAULT_TTL).await {
            warn!("Failed to refresh the TTL on {}: {}", key, err);
        }

        let posts_ids: Vec<i64> = raw
            .iter()
            .filter_map(|s| match s.parse::<i64>() {
                Ok(id) => Some(id),
                Err(_) => {
                    warn!("Skipping malformed entry {:?} in {}", s, key);
                    None
                }
            })
            .collect();

        if total_items == 0 {
            self.instruments.count(Metric::FeedReadsEmpty, 1, &[]);
            return Ok(Response::new(empty_response()));
        }

        self.instruments.count(Metric::FeedReads, 1, &[]);
        Ok(Response::new(protobuf::GetNewsfeedResponse {
            status: RespStatus::Ok as i32,
            posts_ids,
            current_page: page,
            total_pages,
            total_items,
        }))
    }

    /// Remove a deleted post from every feed
    ///
    /// A cursor-based scan over `newsfeed:*` in small batches; errors on individual keys are
    /// logged but don't abort the sweep. Eventually consistent-- concurrent readers may briefly
    /// see the deleted post until the sweep reaches their key.
    async fn remove_post_from_newsfeed(
        &self,
        request: Request<protobuf::RemovePostFromNewsfeedRequest>,
    ) -> StdResult<Response<protobuf::RemovePostFromNewsfeedResponse>, Status> {
        use protobuf::remove_post_from_newsfeed_response::Status as RespStatus;
        let req = request.into_inner();
        let value = PostId::new(req.post_id).to_string();

        let mut removed = 0u64;
        let mut cursor = 0u64;
        loop {
            let (next, keys) = self
                .cache
                .scan(cache::NEWSFEED_KEY_PATTERN, cursor, cache::SCAN_BATCH)
                .await
                .map_err(cache_to_status)?;
            for key in keys {
                match self.cache.lrem(&key, &value).await {
                    Ok(n) => removed += n,
                    Err(err) => warn!("Failed to sweep {} from {}: {}", value, key, err),
                }
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        info!("Swept post {} from the feeds ({} removals).", value, removed);
        self.instruments.count(Metric::FeedSweeps, 1, &[]);
        self.instruments.count(Metric::FeedSweepRemovals, removed, &[]);

        Ok(Response::new(protobuf::RemovePostFromNewsfeedResponse {
            status: RespStatus::Ok as i32,
        }))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::{
        cache::MemoryStore,
        entities::UserId,
        rpc::protobuf::newsfeed_server::Newsfeed,
    };

    struct Fixture {
        svc: NewsfeedService,
        cache: Arc<MemoryStore>,
    }

    fn fixture() -> Fixture {
        let cache = Arc::new(MemoryStore::new());
        let svc = NewsfeedService::new(cache.clone(), Arc::new(Instruments::new("wandersphere")));
        Fixture { svc, cache }
    }

    async fn seed(cache: &MemoryStore, user: i64, ids: &[&str]) {
        let values: Vec<String> = ids.iter().map(|s| s.to_string()).collect();
        cache
            .rpush(
                &cache::newsfeed_key(UserId::new(user)),
                &values,
                cache::DEFAULT_TTL,
            )
            .await
            .unwrap();
    }

    async fn read(
        svc: &NewsfeedService,
        user_id: i64,
        page: u32,
        page_size: u32,
    ) -> protobuf::GetNewsfeedResponse {
        svc.get_newsfeed(Request::new(protobuf::GetNewsfeedRequest {
            user_id,
            page,
            page_size,
        }))
        .await
        .unwrap()
        .into_inner()
    }

    #[tokio::test]
    async fn paginates_oldest_first() {
        let fx = fixture();
        seed(&fx.cache, 2, &["11", "12", "13", "14", "15"]).await;

        let rsp = read(&fx.svc, 2, 1, 2).await;
        assert_eq!(rsp.status, protobuf::get_newsfeed_response::Status::Ok as i32);
        assert_eq!(rsp.posts_ids, vec![11, 12]);
        assert_eq!(rsp.current_page, 1);
        assert_eq!(rsp.total_pages, 3);
        assert_eq!(rsp.total_items, 5);

        let rsp = read(&fx.svc, 2, 3, 2).await;
        assert_eq!(rsp.posts_ids, vec![15]);
        assert_eq!(rsp.total_pages, 3);
    }

    #[tokio::test]
    async fn reads_are_non_destructive_and_idempotent() {
        let fx = fixture();
        seed(&fx.cache, 2, &["11", "12", "13"]).await;

        let first = read(&fx.svc, 2, 1, 2).await;
        let second = read(&fx.svc, 2, 1, 2).await;
        assert_eq!(first.posts_ids, second.posts_ids);
        assert_eq!(first.total_pages, second.total_pages);
        assert_eq!(first.total_items, second.total_items);
        assert_eq!(
            fx.cache
                .llen(&cache::newsfeed_key(UserId::new(2)))
                .await
                .unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn clamps_page_and_page_size() {
        let fx = fixture();
        let ids: Vec<String> = (1..=60).map(|i| i.to_string()).collect();
        let refs: Vec<&str> = ids.iter().map(|s| s.as_str()).collect();
        seed(&fx.cache, 2, &refs).await;

        // page_size=0 → 10
        let rsp = read(&fx.svc, 2, 1, 0).await;
        assert_eq!(rsp.posts_ids.len(), 10);
        // page_size=1000 → 50
        let rsp = read(&fx.svc, 2, 1, 1000).await;
        assert_eq!(rsp.posts_ids.len(), 50);
        assert_eq!(rsp.total_pages, 2);
        // page=0 → 1
        let rsp = read(&fx.svc, 2, 0, 10).await;
        assert_eq!(rsp.current_page, 1);
        assert_eq!(rsp.posts_ids, (1..=10).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn missing_feeds_and_bad_user_ids_read_empty() {
        let fx = fixture();
        let rsp = read(&fx.svc, 2, 1, 10).await;
        assert_eq!(
            rsp.status,
            protobuf::get_newsfeed_response::Status::NewsfeedEmpty as i32
        );
        assert_eq!(rsp.total_items, 0);

        let rsp = read(&fx.svc, 0, 1, 10).await;
        assert_eq!(
            rsp.status,
            protobuf::get_newsfeed_response::Status::NewsfeedEmpty as i32
        );
        let rsp = read(&fx.svc, -3, 1, 10).await;
        assert_eq!(
            rsp.status,
            protobuf::get_newsfeed_response::Status::NewsfeedEmpty as i32
        );
    }

    #[tokio::test]
    async fn malformed_entries_are_skipped() {
        let fx = fixture();
        seed(&fx.cache, 2, &["11", "bogus", "13"]).await;
        let rsp = read(&fx.svc, 2, 1, 10).await;
        assert_eq!(rsp.posts_ids, vec![11, 13]);
        assert_eq!(rsp.total_items, 3); // raw length; decoding skips, the store keeps
    }

    #[tokio::test]
    async fn ttl_is_refreshed_on_read() {
        tokio::time::pause();
        let fx = fixture();
        seed(&fx.cache, 2, &["11"]).await;
        // Halfway to expiry, a read should push the deadline back out
        tokio::time::advance(std::time::Duration::from_secs(23 * 60 * 60)).await;
        read(&fx.svc, 2, 1, 10).await;
        tokio::time::advance(std::time::Duration::from_secs(23 * 60 * 60)).await;
        let rsp = read(&fx.svc, 2, 1, 10).await;
        assert_eq!(rsp.status, protobuf::get_newsfeed_response::Status::Ok as i32);
    }

    // After the sweep completes, no feed contains the deleted post.
    #[tokio::test]
    async fn sweep_removes_a_post_from_every_feed() {
        let fx = fixture();
        // More feeds than one scan batch, to exercise the cursor
        for user in 1..=25 {
            seed(&fx.cache, user, &["7", "8", "7"]).await;
        }

        let rsp = fx
            .svc
            .remove_post_from_newsfeed(Request::new(protobuf::RemovePostFromNewsfeedRequest {
                post_id: 7,
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(
            rsp.status,
            protobuf::remove_post_from_newsfeed_response::Status::Ok as i32
        );

        for user in 1..=25 {
            assert_eq!(
                fx.cache
                    .lrange(&cache::newsfeed_key(UserId::new(user)), 0, -1)
                    .await
                    .unwrap(),
                vec!["8".to_owned()]
            );
        }
    }
}
