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

//! # wandersphere-shared
//!
//! Types shared between the wandersphere services, the HTTP gateway, and their clients
//! (including the integration test harness). Putting these in their own crate keeps the
//! test client from having to link the entire service crate just to speak the API.

use std::time::Duration;

use serde::Deserialize;
use snafu::{Backtrace, Snafu};

pub mod api;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("[{min:?}, {max:?}] is not a valid Duration range"))]
    DurationRange {
        min: Duration,
        max: Duration,
        backtrace: Backtrace,
    },
    #[snafu(display("{value} is not a valid Jitter value"))]
    Jitter { value: f64, backtrace: Backtrace },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      exponential backoffs                                      //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A pair of [Duration]s that carries with it the guarantee that the first is less than or equal to
/// the second, and that the second is non-zero
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct DurationRange {
    min: Duration,
    max: Duration,
}

impl DurationRange {
    pub fn new(min: Duration, max: Duration) -> Result<DurationRange> {
        if min > max || max == Duration::from_millis(0) {
            DurationRangeSnafu { min, max }.fail()
        } else {
            Ok(DurationRange { min, max })
        }
    }
    pub fn lower(&self) -> &Duration {
        &self.min
    }
    pub fn upper(&self) -> &Duration {
        &self.max
    }
}

/// A refinement of [f64] that asserts that it is also in the range [0, 100), as well as being
/// neither infinite nor NaN.
#[derive(Clone, Copy, Debug, Default, Deserialize)]
pub struct Jitter(f64);

impl std::fmt::Display for Jitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{Jitter {}%}}", self.0)
    }
}

impl TryFrom<f64> for Jitter {
    type Error = Error;

    fn try_from(value: f64) -> std::result::Result<Self, Self::Error> {
        if !value.is_finite() || !(0.0..100.0).contains(&value) {
            JitterSnafu { value }.fail()
        } else {
            Ok(Jitter(value))
        }
    }
}

impl AsRef<f64> for Jitter {
    fn as_ref(&self) -> &f64 {
        &self.0
    }
}

/// Parameters for an exponential backoff policy
///
/// The fan-out worker (and anything else that talks to a flaky dependency) retries transient
/// failures a bounded number of times, sleeping between attempts, with the sleep doubling on each
/// attempt (clamped to `durations.upper()`).
#[derive(Clone, Debug, Deserialize)]
pub struct ExponentialBackoffParameters {
    durations: DurationRange,
    jitter: Jitter,
    #[serde(rename = "num-attempts")]
    num_attempts: usize,
}

impl ExponentialBackoffParameters {
    pub fn new(durations: DurationRange, jitter: Jitter, num_attempts: usize) -> Self {
        ExponentialBackoffParameters {
            durations,
            jitter,
            num_attempts,
        }
    }
    pub fn jitter(&self) -> f64 {
        *self.jitter.as_ref()
    }
    pub fn lower(&self) -> &Duration {
        self.durations.lower()
    }
    pub fn num_attempts(&self) -> usize {
        self.num_attempts
    }
    pub fn upper(&self) -> &Duration {
        self.durations.upper()
    }
    /// The sequence of sleeps to be taken *between* attempts; one fewer than `num_attempts`.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let lower = *self.durations.lower();
        let upper = *self.durations.upper();
        (0..self.num_attempts.saturating_sub(1)).map(move |i| {
            let delay = lower.saturating_mul(1u32 << i.min(16));
            std::cmp::min(delay, upper)
        })
    }
}

impl Default for ExponentialBackoffParameters {
    fn default() -> Self {
        // Up to three attempts, starting at 100ms & doubling.
        ExponentialBackoffParameters {
            durations: DurationRange::new(Duration::from_millis(100), Duration::from_secs(5))
                .unwrap(/* known good */),
            jitter: Jitter::default(),
            num_attempts: 3,
        }
    }
}
