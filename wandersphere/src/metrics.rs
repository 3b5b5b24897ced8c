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

//! # wandersphere metrics
//!
//! wandersphere uses [OpenTelemetry] to collect metrics. OTel calls the actual counters
//! "instruments" & advises re-using them rather than creating them repeatedly-- fine, but where
//! to keep them? I'd rather not litter the service state types with dozens of `Counter<u64>`
//! fields, and a stringly-keyed map trades one problem for two: a typo'd name at a call-site
//! becomes a runtime panic (or worse, a silently separate time series), and nothing stops two
//! call-sites from colliding on the same name.
//!
//! [OpenTelemetry]: https://docs.rs/opentelemetry/latest/opentelemetry/index.html
//!
//! wandersphere's needs are modest: a fixed, smallish set of counters, enumerable at compile
//! time. So that's what this is-- [Metric] is the closed set of everything the services count,
//! and [Instruments] pre-builds one instrument per variant. A call-site can't misspell a variant,
//! two metrics can't share a name without the `name()` match making the collision obvious in
//! review, and adding a metric is: add the variant, name it, count it.
//!
//! ```ignore
//! state.instruments.count(Metric::FanOutAppends, keys.len() as u64, &[]);
//! ```
//!
//! Exporter wiring (OTLP, Prometheus & friends) is an operational concern left to the
//! deployment; only the API-level instrumentation lives here.

use std::collections::HashMap;

use opentelemetry::{global, metrics::Counter, KeyValue};

/// Everything wandersphere counts
///
/// One variant per time series, grouped by the service that emits it. `ALL` must list every
/// variant-- [Instruments::new] pre-builds from it, and the `every_metric_counts` test below
/// walks it, so a variant omitted there fails the suite rather than panicking in production.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Metric {
    // The authoring service
    UsersCreated,
    PostsCreated,
    PostsDeleted,
    /// Fire-and-forget publish after post creation failed or timed-out
    PublishFailures,
    /// Best-effort sweep notification after post deletion failed or timed-out
    SweepFailures,
    // The newsfeed publisher
    /// Post ids appended to follower feeds
    FanOutAppends,
    /// Appends abandoned after exhausting their retries
    FanOutAppendFailures,
    /// Times the broker was down & fan-out ran on the RPC task instead
    InlineFanOuts,
    RecordsConsumed,
    /// Records skipped: unrecognized key or malformed value
    RecordsSkipped,
    // The newsfeed reader
    FeedReads,
    FeedReadsEmpty,
    FeedSweeps,
    /// Individual feed entries removed across all sweeps
    FeedSweepRemovals,
    // The gateway
    Signups,
    Logins,
    LoginFailures,
}

impl Metric {
    pub const ALL: [Metric; 17] = [
        Metric::UsersCreated,
        Metric::PostsCreated,
        Metric::PostsDeleted,
        Metric::PublishFailures,
        Metric::SweepFailures,
        Metric::FanOutAppends,
        Metric::FanOutAppendFailures,
        Metric::InlineFanOuts,
        Metric::RecordsConsumed,
        Metric::RecordsSkipped,
        Metric::FeedReads,
        Metric::FeedReadsEmpty,
        Metric::FeedSweeps,
        Metric::FeedSweepRemovals,
        Metric::Signups,
        Metric::Logins,
        Metric::LoginFailures,
    ];

    /// The name under which this metric is exported
    pub fn name(self) -> &'static str {
        match self {
            Metric::UsersCreated => "authpost.users.created",
            Metric::PostsCreated => "authpost.posts.created",
            Metric::PostsDeleted => "authpost.posts.deleted",
            Metric::PublishFailures => "authpost.publish.failures",
            Metric::SweepFailures => "authpost.sweep.failures",
            Metric::FanOutAppends => "publisher.appends",
            Metric::FanOutAppendFailures => "publisher.appends.failed",
            Metric::InlineFanOuts => "publisher.inline.fanouts",
            Metric::RecordsConsumed => "publisher.records.consumed",
            Metric::RecordsSkipped => "publisher.records.skipped",
            Metric::FeedReads => "newsfeed.reads",
            Metric::FeedReadsEmpty => "newsfeed.reads.empty",
            Metric::FeedSweeps => "newsfeed.sweeps",
            Metric::FeedSweepRemovals => "newsfeed.sweeps.removed",
            Metric::Signups => "gateway.signups",
            Metric::Logins => "gateway.logins",
            Metric::LoginFailures => "gateway.logins.failed",
        }
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Container for the OTel instruments behind [Metric]
///
/// Pre-building every counter up front keeps `count` at `&self`, so an instance can be shared
/// across the handlers in an `Arc`.
pub struct Instruments {
    counters: HashMap<Metric, Counter<u64>>,
}

impl Instruments {
    pub fn new(prefix: &'static str) -> Instruments {
        let meter = global::meter(prefix);
        Instruments {
            counters: Metric::ALL
                .iter()
                .map(|metric| (*metric, meter.u64_counter(metric.name()).build()))
                .collect(),
        }
    }
    /// Bump `metric` by `count`
    pub fn count(&self, metric: Metric, count: u64, attributes: &[KeyValue]) {
        self.counters[&metric].add(count, attributes);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::collections::HashSet;

    #[test]
    fn names_are_unique() {
        let names: HashSet<&'static str> = Metric::ALL.iter().map(|m| m.name()).collect();
        assert_eq!(names.len(), Metric::ALL.len());
    }

    // Walks ALL; a variant left out of it would panic here instead of in a handler.
    #[test]
    fn every_metric_counts() {
        let instruments = Instruments::new("wandersphere");
        for metric in Metric::ALL {
            instruments.count(metric, 1, &[]);
        }
    }
}
