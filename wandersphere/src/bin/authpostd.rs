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

//! # authpostd
//!
//! The wandersphere authoring service daemon: users, posts, comments, likes & the follow graph,
//! served over gRPC, backed by PostgreSQL.

use std::sync::Arc;

use snafu::{prelude::*, Snafu};
use tonic::transport::Server as TonicServer;
use tracing::info;

use wandersphere::{
    authpost::AuthPostService,
    bootstrap::{self, CliOpts},
    client::{GrpcNewsfeed, GrpcPublisher, NewsfeedApi, PublishApi},
    config,
    metrics::Instruments,
    postgres,
    rpc::protobuf::authenticate_and_post_server::AuthenticateAndPostServer,
    storage::Backend as StorageBackend,
};

/// The authpostd application error type
///
/// Note that Debug is implemented by hand, in terms of Display: `main()` returns
/// `Result<(), Error>`, and the Rust runtime prints the `Debug` representation on the error path,
/// whose derived form is not fit for operators.
#[derive(Snafu)]
pub enum Error {
    #[snafu(display("{source}"))]
    Bootstrap { source: wandersphere::bootstrap::Error },
    #[snafu(display("Invalid client configuration: {source}"))]
    Client { source: wandersphere::client::Error },
    #[snafu(display("{source}"))]
    Config { source: config::Error },
    #[snafu(display("Failed to connect to PostgreSQL: {source}"))]
    Postgres { source: postgres::Error },
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
    let cfg = config::parse_config(&opts.cfg).context(ConfigSnafu)?.authpost;
    bootstrap::configure_logging(&opts.log_opts, &cfg.logger).context(BootstrapSnafu)?;
    info!("authpostd version {} starting.", clap::crate_version!());

    let storage: Arc<dyn StorageBackend + Send + Sync> = {
        let store = postgres::Store::new(
            &cfg.postgres.dsn,
            cfg.postgres.max_open_connections,
            cfg.postgres.idle_timeout(),
            cfg.postgres.max_lifetime(),
        )
        .await
        .context(PostgresSnafu)?;
        store.ensure_schema().await.context(PostgresSnafu)?;
        Arc::new(store)
    };

    // The downstream services are optional: with no hosts configured, the corresponding
    // notification is simply skipped (& logged) rather than refusing to start.
    let publisher: Option<Arc<dyn PublishApi + Send + Sync>> =
        match cfg.hosts.newsfeed_publishing.is_empty() {
            true => None,
            false => Some(Arc::new(
                GrpcPublisher::new(cfg.hosts.newsfeed_publishing.clone()).context(ClientSnafu)?,
            )),
        };
    let newsfeed: Option<Arc<dyn NewsfeedApi + Send + Sync>> = match cfg.hosts.newsfeed.is_empty()
    {
        true => None,
        false => Some(Arc::new(
            GrpcNewsfeed::new(cfg.hosts.newsfeed.clone()).context(ClientSnafu)?,
        )),
    };

    let svc = AuthPostService::new(
        storage,
        publisher,
        newsfeed,
        Arc::new(Instruments::new("wandersphere")),
    );

    let health = bootstrap::HealthServer::bind(
        cfg.port.health_addr().context(ConfigSnafu)?,
    )
    .await
    .context(BootstrapSnafu)?;

    let addr = cfg.port.listen_addr();
    info!("authpostd listening on {}.", addr);
    TonicServer::builder()
        .add_service(AuthenticateAndPostServer::new(svc))
        .serve_with_shutdown(addr, bootstrap::shutdown_signal())
        .await
        .context(ServeSnafu)?;

    health.stop().await;
    info!("authpostd exiting.");
    Ok(())
}

fn main() -> Result<()> {
    let opts = CliOpts::new(
        bootstrap::cli("authpostd", "The wandersphere authoring service").get_matches(),
    );
    tokio::runtime::Runtime::new()
        .context(TokioRuntimeSnafu)?
        .block_on(serve(opts))
}
