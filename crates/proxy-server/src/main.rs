mod api;
mod cluster;
mod config;
mod error;
mod policy;
mod proxy;
mod server;
mod telemetry;

use clap::Parser;
use config::Config;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Caching forward HTTP proxy.
#[derive(Parser, Debug)]
#[command(name = "sluice", version)]
struct Args {
    /// Path to the TOML config file
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Number of worker processes (overrides `cluster.workers`, 0 = single process)
    #[arg(long)]
    workers: Option<usize>,

    /// Set by the supervisor when spawning a worker
    #[arg(long, hide = true)]
    worker_id: Option<u32>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Workers keep stdout for status lines, so their logs go to stderr.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.worker_id.is_some() {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    }

    let mut config = Config::load_or_default(&args.config);
    if let Some(workers) = args.workers {
        config.cluster.workers = workers;
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let result = match args.worker_id {
        Some(id) => server::run_worker(config, Some(id), shutdown).await,
        None if config.cluster.workers > 0 => {
            cluster::run_supervisor(&config, &args.config, shutdown).await
        }
        None => server::run_worker(config, None, shutdown).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "server error");
            ExitCode::FAILURE
        }
    }
}

/// Listen for SIGINT (Ctrl+C) or SIGTERM and cancel the shutdown token.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "ctrl-c handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }

    tracing::info!("shutdown signal received, draining connections...");
    token.cancel();
}
