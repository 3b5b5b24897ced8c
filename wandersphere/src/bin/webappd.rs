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

//! # webappd
//!
//! The wandersphere HTTP gateway daemon: the public `/api/v1` surface, translating HTTP+cookie
//! sessions into authenticated gRPC calls. Owns no business state.

use std::sync::Arc;

use snafu::{prelude::*, Snafu};
use tokio::net::TcpListener;
use tracing::info;

use wandersphere::{
    bootstrap::{self, CliOpts},
    cache, client,
    client::{GrpcAuthPost, GrpcNewsfeed},
    config,
    gateway::{make_router, Gateway},
    metrics::Instruments,
};

#[derive(Snafu)]
pub enum Error {
    #[snafu(display("Failed to bind the listen address: {source}"))]
    Bind { source: std::io::Error },
    #[snafu(display("{source}"))]
    Bootstrap { source: wandersphere::bootstrap::Error },
    #[snafu(display("Invalid client configuration: {source}"))]
    Client { source: client::Error },
    #[snafu(display("{source}"))]
    Config { source: config::Error },
    #[snafu(display("HTTP server failure: {source}"))]
    Serve { source: std::io::Error },
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
    let cfg = config::parse_config(&opts.cfg).context(ConfigSnafu)?.webapp;
    bootstrap::configure_logging(&opts.log_opts, &cfg.logger).context(BootstrapSnafu)?;
    info!("webappd version {} starting.", clap::crate_version!());

    let store = cache::select_store(
        &cfg.key_value.address,
        cfg.key_value.password.as_deref(),
        cfg.key_value.db,
        cfg.key_value.connect_timeout(),
    )
    .await;

    let state = Arc::new(Gateway {
        authpost: Arc::new(GrpcAuthPost::new(cfg.hosts.authpost.clone()).context(ClientSnafu)?),
        newsfeed: Arc::new(GrpcNewsfeed::new(cfg.hosts.newsfeed.clone()).context(ClientSnafu)?),
        cache: store,
        session: cfg.session.clone(),
        instruments: Arc::new(Instruments::new("wandersphere")),
    });

    let health = bootstrap::HealthServer::bind(
        cfg.port.health_addr().context(ConfigSnafu)?,
    )
    .await
    .context(BootstrapSnafu)?;

    let addr = cfg.port.listen_addr();
    let listener = TcpListener::bind(addr).await.context(BindSnafu)?;
    info!("webappd listening on {}.", addr);
    axum::serve(listener, make_router(state))
        .with_graceful_shutdown(bootstrap::shutdown_signal())
        .await
        .context(ServeSnafu)?;

    health.stop().await;
    info!("webappd exiting.");
    Ok(())
}

fn main() -> Result<()> {
    let opts = CliOpts::new(
        bootstrap::cli("webappd", "The wandersphere HTTP gateway").get_matches(),
    );
    tokio::runtime::Runtime::new()
        .context(TokioRuntimeSnafu)?
        .block_on(serve(opts))
}
