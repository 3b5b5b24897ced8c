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

//! # Daemon bootstrap
//!
//! The four wandersphere daemons share their start-up shape: a small CLI (most configuration
//! lives in the YAML file), tracing setup (stdout or file, compact or JSON), a sidecar health
//! router on `port + 100`, & signal-driven graceful shutdown. That shared plumbing lives here so
//! each `main` can concern itself with wiring its own dependencies.

use std::{
    fs::OpenOptions,
    io,
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use clap::{value_parser, Arg, ArgAction, Command};
use snafu::{prelude::*, Backtrace};
use tokio::{net::TcpListener, sync::Notify};
use tracing::{info, Level};
use tracing_subscriber::{filter::EnvFilter, fmt, layer::SubscriberExt, Layer, Registry};

use crate::config::LoggerConfig;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to bind {addr}: {source}"))]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to parse RUST_LOG: {source}"))]
    EnvFilter {
        source: tracing_subscriber::filter::FromEnvError,
    },
    #[snafu(display("Failed to open the log file: {source}"))]
    LogFile {
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to set the tracing subscriber: {source}"))]
    Subscriber {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         the common CLI                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Logging-related options read from the command line or the environment
pub struct LogOpts {
    pub plain: bool,
    pub level: Option<Level>,
}

impl LogOpts {
    fn new(matches: &clap::ArgMatches) -> LogOpts {
        LogOpts {
            plain: matches.get_flag("plain"),
            level: match (
                matches.get_flag("debug"),
                matches.get_flag("verbose"),
                matches.get_flag("quiet"),
            ) {
                (true, _, _) => Some(Level::TRACE),
                (false, true, _) => Some(Level::DEBUG),
                (false, false, true) => Some(Level::ERROR),
                // Defer to the configuration file
                (_, _, _) => None,
            },
        }
    }
}

/// Configuration options read from the CLI (or the environment)
pub struct CliOpts {
    pub log_opts: LogOpts,
    pub cfg: Option<PathBuf>,
}

impl CliOpts {
    pub fn new(matches: clap::ArgMatches) -> CliOpts {
        CliOpts {
            log_opts: LogOpts::new(&matches),
            cfg: matches.get_one::<PathBuf>("config").cloned(),
        }
    }
}

/// The argument set every daemon accepts; most configuration lives in the file named by `-c`
pub fn cli(name: &'static str, about: &'static str) -> Command {
    Command::new(name)
        .version(clap::crate_version!())
        .author(clap::crate_authors!())
        .about(about)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .num_args(1)
                .value_parser(value_parser!(PathBuf))
                .env("WANDERSPHERE_CONFIG")
                .help(
                    "path (absolute or relative to the process' current directory) to a \
                     configuration file",
                ),
        )
        .arg(
            Arg::new("debug")
                .short('D')
                .long("debug")
                .num_args(0)
                .action(ArgAction::SetTrue)
                .env("WANDERSPHERE_DEBUG")
                .help("produce debug output"),
        )
        .arg(
            Arg::new("plain")
                .short('p')
                .long("plain")
                .num_args(0)
                .action(ArgAction::SetTrue)
                .env("WANDERSPHERE_PLAIN")
                .help("log in human-readable format, not JSON/structured logging"),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .num_args(0)
                .action(ArgAction::SetTrue)
                .env("WANDERSPHERE_QUIET")
                .help("produce only error output"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .num_args(0)
                .action(ArgAction::SetTrue)
                .env("WANDERSPHERE_VERBOSE")
                .help("produce prolix output"),
        )
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             logging                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

fn level_from_config(text: &str) -> Level {
    match text {
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Configure logging for the process
///
/// CLI flags beat the configuration file for the level; `RUST_LOG` beats both. Output goes to the
/// file named in config if there is one, stdout otherwise (the usual case inside a container),
/// JSON-formatted unless `--plain` was given.
///
/// This can only be invoked once (it calls tracing's `set_global_default`).
pub fn configure_logging(log_opts: &LogOpts, config: &LoggerConfig) -> Result<()> {
    let level = log_opts
        .level
        .unwrap_or_else(|| level_from_config(&config.level));
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env()
        .context(EnvFilterSnafu)?;

    // `json()` & `with_writer()` produce differently-typed builders, hence the boxed Layer.
    let formatter: Box<dyn Layer<Registry> + Send + Sync> = match &config.path {
        Some(path) => {
            let fd = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .context(LogFileSnafu)?;
            if log_opts.plain {
                Box::new(
                    fmt::Layer::default()
                        .compact()
                        .with_ansi(false)
                        .with_writer(Mutex::new(fd)),
                )
            } else {
                Box::new(fmt::Layer::default().json().with_writer(Mutex::new(fd)))
            }
        }
        None => {
            if log_opts.plain {
                Box::new(fmt::Layer::default().compact().with_writer(io::stdout))
            } else {
                Box::new(fmt::Layer::default().json().with_writer(io::stdout))
            }
        }
    };

    tracing::subscriber::set_global_default(Registry::default().with(formatter).with(filter))
        .context(SubscriberSnafu)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       shutdown & health                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Resolve when the process is asked to stop (SIGTERM or SIGINT)
pub async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("installing SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM; shutting down."),
        _ = sigint.recv() => info!("Received SIGINT; shutting down."),
    }
}

/// Handle on the sidecar health server
pub struct HealthServer {
    handle: tokio::task::JoinHandle<()>,
    shutdown: Arc<Notify>,
}

impl HealthServer {
    /// Stand up the `/healthcheck` router on `addr`
    pub async fn bind(addr: SocketAddr) -> Result<HealthServer> {
        let listener = TcpListener::bind(addr).await.context(BindSnafu { addr })?;
        let shutdown = Arc::new(Notify::new());
        let nfy = shutdown.clone();
        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, crate::gateway::make_health_router())
                .with_graceful_shutdown(async move { nfy.notified().await });
            if let Err(err) = server.await {
                tracing::error!("Health server failed: {}", err);
            }
        });
        info!("Health server listening on {}.", addr);
        Ok(HealthServer { handle, shutdown })
    }
    /// Stop the server & wait for it
    pub async fn stop(self) {
        self.shutdown.notify_one();
        let _ = self.handle.await;
    }
}
