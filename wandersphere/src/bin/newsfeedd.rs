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

//! # newsfeedd
//!
//! The wandersphere newsfeed reader daemon: paginated reads over the per-user feed lists, plus
//! the cross-feed sweep invoked when a post is deleted.

use std::sync::Arc;

use snafu::{prelude::*, Snafu};
use tonic::transport::Server as TonicServer;
use tracing::info;

use wandersphere::{
    bootstrap::{self, CliOpts},
    cache, config,
    metrics::Instruments,
    newsfeed::NewsfeedService,
    rpc::protobuf::newsfeed_server::NewsfeedServer,
};

#[derive(Snafu)]
pub enum Error {
    #[snafu(display("{source}"))]
    Bootstrap { source: wandersphere::bootstrap::Error },
    #[snafu(display("{source}"))]
    Config { source: config::Error },
    #[snafu(display("gRPC server failure: {source}"))]
    Serve { source: tonic::transport::Error },
    #[snafu(display("Failed to instantiate a Tokio runtime: {source}"))]
    TokioRuntime { source: std::io::Error },
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self, f)
    }
}

type Result<T> = std::result::Result<T, Error>;

async fn serve(opts: CliOpts) -> Result<()> {
    let cfg = config::parse_config(&opts.cfg).context(ConfigSnafu)?.newsfeed;
    bootstrap::configure_logging(&opts.log_opts, &cfg.logger).context(BootstrapSnafu)?;
    info!("newsfeedd version {} starting.", clap::crate_version!());

    let store = cache::select_store(
        &cfg.key_value.address,
        cfg.key_value.password.as_deref(),
        cfg.key_value.db,
        cfg.key_value.connect_timeout(),
    )
    .await;

    let svc = NewsfeedService::new(store, Arc::new(Instruments::new("wandersphere")));

    let health = bootstrap::HealthServer::bind(
        cfg.port.health_addr().context(ConfigSnafu)?,
    )
    .await
    .context(BootstrapSnafu)?;

    let addr = cfg.port.listen_addr();
    info!("newsfeedd listening on {}.", addr);
    TonicServer::builder()
        .add_service(NewsfeedServer::new(svc))
        .serve_with_shutdown(addr, bootstrap::shutdown_signal())
        .await
        .context(ServeSnafu)?;

    health.stop().await;
    info!("newsfeedd exiting.");
    Ok(())
}

fn main() -> Result<()> {
    let opts = CliOpts::new(
        bootstrap::cli("newsfeedd", "The wandersphere newsfeed reader").get_matches(),
    );
    tokio::runtime::Runtime::new()
        .context(TokioRuntimeSnafu)?
        .block_on(serve(opts))
}
