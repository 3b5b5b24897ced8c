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

//! # smoke
//!
//! End-to-end exercises of a live wandersphere deployment: the signup/login/session flow,
//! the follow graph, fan-out-on-write, pagination & the deletion sweep.
//!
//! Point `WANDERSPHERE_TEST_URL` at the gateway (e.g. `http://localhost:19000`) & run
//! `cargo test -p wandersphere-test`. With the variable unset every trial is ignored.
//!
//! The degraded-mode behaviors (broker down, key-value store down) are exercised by unit tests
//! in the service crate; black-box tests can't helpfully break infrastructure out from under a
//! shared deployment.

use std::future::Future;

use libtest_mimic::{Arguments, Failed, Trial};
use url::Url;

use wandersphere_test::{
    test_delete_sweeps_feeds, test_duplicate_signup, test_fan_out, test_healthcheck,
    test_non_author_may_not_delete, test_pagination, test_self_follow_rejected,
    test_signup_and_login,
};

fn trial<F, Fut>(name: &'static str, base: Option<Url>, f: F) -> Trial
where
    F: FnOnce(Url) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), Failed>>,
{
    let ignored = base.is_none();
    Trial::test(name, move || {
        let base = base.expect("ignored trials are never run");
        tokio::runtime::Runtime::new()
            .map_err(|err| Failed::from(format!("failed to start a runtime: {}", err)))?
            .block_on(f(base))
    })
    .with_ignored_flag(ignored)
}

fn main() -> std::process::ExitCode {
    let args = Arguments::from_args();

    let base = std::env::var("WANDERSPHERE_TEST_URL")
        .ok()
        .map(|text| Url::parse(&text).expect("WANDERSPHERE_TEST_URL must be a valid URL"));

    let trials = vec![
        trial("000_healthcheck", base.clone(), |base| async move {
            test_healthcheck(&base).await
        }),
        trial("010_signup_and_login", base.clone(), |base| async move {
            test_signup_and_login(&base).await
        }),
        trial("020_duplicate_signup", base.clone(), |base| async move {
            test_duplicate_signup(&base).await
        }),
        trial("030_self_follow_rejected", base.clone(), |base| async move {
            test_self_follow_rejected(&base).await
        }),
        trial("040_fan_out_on_write", base.clone(), |base| async move {
            test_fan_out(&base).await
        }),
        trial("050_pagination", base.clone(), |base| async move {
            test_pagination(&base).await
        }),
        trial("060_delete_sweeps_feeds", base.clone(), |base| async move {
            test_delete_sweeps_feeds(&base).await
        }),
        trial(
            "070_non_author_may_not_delete",
            base.clone(),
            |base| async move { test_non_author_may_not_delete(&base).await },
        ),
    ];

    libtest_mimic::run(&args, trials).exit_code()
}
