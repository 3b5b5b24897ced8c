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

//! # nfpublishd
//!
//! The wandersphere newsfeed publisher daemon: the `PublishPost` gRPC ingress & the fan-out
//! worker, sharing one process. Degrades gracefully when the log broker or the key-value store
//! is unavailable at startup (see [publisher](wandersphere::publisher)).

use std::{sync::Arc, time::Duration};

use snafu::{prelude::*, Snafu};
use tonic::transport::Server as TonicServer;
use tracing::info;

use wandersphere::{
    bootstrap::{self, CliOpts},
    cache, client,
    client::GrpcAuthPost,
    config,
    eventlog::KafkaLog,
    metrics::Instruments,
    publisher::{spawn_worker, PublishingService},
    rpc::protobuf::newsfeed_publishing_server::NewsfeedPublishingServer,
};

/// How long to allow the worker to wrap up its current record on shutdown
const WORKER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Snafu)]
pub enum Error {
    #[snafu(display("{source}"))]
    Bootstrap { source: wandersphere::bootstrap::Error },
    #[snafu(display("Invalid client configuration: {source}"))]
    Client { source: client::Error },
    #[snafu(display("{source}"))]
    Config { source: config::Error },
    #[snafu(display("Failed to set up the event log client: {source}"))]
    EventLog { source: wandersphere::eventlog::Error },
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
    let cfg = config::parse_config(&opts.cfg)
        .context(ConfigSnafu)?
        .newsfeed_publishing;
    bootstrap::configure_logging(&opts.log_opts, &cfg.logger).context(BootstrapSnafu)?;
    info!("nfpublishd version {} starting.", clap::crate_version!());

    // The Kafka client is lazy; a broker that's down at startup shows up as failed appends &
    // reads, which is exactly what the degraded-mode logic wants to see.
    let log = Arc::new(
        KafkaLog::new(
            &cfg.event_log.brokers,
            &cfg.event_log.topic,
            &cfg.event_log.consumer_group,
        )
        .context(EventLogSnafu)?,
    );
    // The key-value store, by contrast, is probed here: unreachable means we fall back to the
    // in-process store for the life of this process.
    let store = cache::select_store(
        &cfg.key_value.address,
        cfg.key_value.password.as_deref(),
        cfg.key_value.db,
        cfg.key_value.connect_timeout(),
    )
    .await;

    let followers = Arc::new(GrpcAuthPost::new(cfg.hosts.authpost.clone()).context(ClientSnafu)?);

    let svc = Arc::new(PublishingService::new(
        log,
        store,
        followers,
        cfg.backoff.clone(),
        Arc::new(Instruments::new("wandersphere")),
    ));

    let worker = spawn_worker(svc.clone());

    let health = bootstrap::HealthServer::bind(
        cfg.port.health_addr().context(ConfigSnafu)?,
    )
    .await
    .context(BootstrapSnafu)?;

    let addr = cfg.port.listen_addr();
    info!("nfpublishd listening on {}.", addr);
    TonicServer::builder()
        .add_service(NewsfeedPublishingServer::new(svc))
        .serve_with_shutdown(addr, bootstrap::shutdown_signal())
        .await
        .context(ServeSnafu)?;

    // In-flight RPCs have drained; now flip the worker's flag & let it finish its record
    if let Err(err) = worker.shutdown(WORKER_SHUTDOWN_TIMEOUT).await {
        tracing::error!("The fan-out worker ended badly: {}", err);
    }
    health.stop().await;
    info!("nfpublishd exiting.");
    Ok(())
}

fn main() -> Result<()> {
    let opts = CliOpts::new(
        bootstrap::cli("nfpublishd", "The wandersphere newsfeed publisher").get_matches(),
    );
    tokio::runtime::Runtime::new()
        .context(TokioRuntimeSnafu)?
        .block_on(serve(opts))
}
