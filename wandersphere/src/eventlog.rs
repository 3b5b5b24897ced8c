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

//! # eventlog
//!
//! The partitioned log between post creation & newsfeed fan-out.
//!
//! Records are keyed byte strings; the only key wandersphere produces today is `"post"`, whose
//! value is the JSON object `{"user_id":<i64>,"post_id":<i64>}`. Consumers skip records with keys
//! they don't recognize, so new record types can be introduced without coordinating deployments.
//! There is no schema registry.
//!
//! The broker behind the [Log] trait is Kafka; readers share a consumer group so that fan-out
//! work is sharded across worker instances.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::{
    consumer::{Consumer, StreamConsumer},
    message::Message,
    producer::{FutureProducer, FutureRecord},
    ClientConfig,
};
use serde::{Deserialize, Serialize};
use snafu::{prelude::*, Backtrace, IntoError};

use crate::entities::{PostId, UserId};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to configure the log client: {source}"))]
    Config {
        source: rdkafka::error::KafkaError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to decode a record value: {source}"))]
    De {
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Log read failed: {source}"))]
    Read {
        source: rdkafka::error::KafkaError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to serialize a record value: {source}"))]
    Ser {
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to subscribe to topic {topic}: {source}"))]
    Subscribe {
        topic: String,
        source: rdkafka::error::KafkaError,
        backtrace: Backtrace,
    },
    #[snafu(display("Log append failed: {source}"))]
    Write {
        source: rdkafka::error::KafkaError,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            records                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The record key under which post publications are written
pub const POST_KEY: &[u8] = b"post";

/// One record as read back from the log
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Record {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// The wire form of a post-publication event
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PostRecord {
    pub user_id: i64,
    pub post_id: i64,
}

impl PostRecord {
    pub fn new(user_id: UserId, post_id: PostId) -> PostRecord {
        PostRecord {
            user_id: user_id.as_i64(),
            post_id: post_id.as_i64(),
        }
    }
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context(SerSnafu)
    }
    pub fn from_json(value: &[u8]) -> Result<PostRecord> {
        serde_json::from_slice(value).context(DeSnafu)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           the trait                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Object-safe trait abstracting over the event log
#[async_trait]
pub trait Log {
    /// Append one keyed record
    async fn append(&self, key: &[u8], value: &[u8]) -> Result<()>;
    /// Read the next record, waiting at most `wait`; `None` means the wait elapsed (which is not
    /// an error-- the worker loop just comes back around)
    async fn read(&self, wait: Duration) -> Result<Option<Record>>;
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            KafkaLog                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// [Log] implementation backed by a Kafka topic
///
/// The producer side buffers in-process & is asynchronous; the consumer side joins the configured
/// consumer group. Construction is lazy-- a broker that's down at startup doesn't fail `new()`,
/// it fails (or times-out) the individual operations, which is exactly what the degraded-mode
/// logic upstairs wants to observe.
pub struct KafkaLog {
    producer: FutureProducer,
    consumer: StreamConsumer,
    topic: String,
}

/// Bound on how long we'll wait for the broker to acknowledge one append
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

impl KafkaLog {
    pub fn new(brokers: &[String], topic: &str, group: &str) -> Result<KafkaLog> {
        let brokers = brokers.join(",");
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "5000")
            .create()
            .context(ConfigSnafu)?;
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("group.id", group)
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "earliest")
            .create()
            .context(ConfigSnafu)?;
        consumer.subscribe(&[topic]).context(SubscribeSnafu {
            topic: topic.to_owned(),
        })?;
        Ok(KafkaLog {
            producer,
            consumer,
            topic: topic.to_owned(),
        })
    }
}

#[async_trait]
impl Log for KafkaLog {
    async fn append(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.producer
            .send(
                FutureRecord::to(&self.topic).key(key).payload(value),
                SEND_TIMEOUT,
            )
            .await
            .map(|_| ())
            .map_err(|(err, _)| WriteSnafu.into_error(err))
    }
    async fn read(&self, wait: Duration) -> Result<Option<Record>> {
        match tokio::time::timeout(wait, self.consumer.recv()).await {
            Ok(Ok(message)) => Ok(Some(Record {
                key: message.key().unwrap_or_default().to_vec(),
                value: message.payload().unwrap_or_default().to_vec(),
            })),
            Ok(Err(err)) => Err(ReadSnafu.into_error(err)),
            Err(_) => Ok(None),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn post_record_round_trip() {
        let record = PostRecord::new(UserId::new(1), PostId::new(7));
        let json = record.to_json().unwrap();
        // The wire format is load-bearing; other-language consumers parse exactly this
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(&json).unwrap(),
            serde_json::json!({"user_id": 1, "post_id": 7})
        );
        assert_eq!(PostRecord::from_json(&json).unwrap(), record);
        assert!(PostRecord::from_json(b"{\"user_id\":\"oops\"}").is_err());
    }
}
