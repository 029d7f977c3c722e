//! Titan node runner
//!
//! Single binary that keeps a set of accounts online as Titan nodes:
//! 1. Loads accounts and endpoints from TOML (+ env refresh credentials)
//! 2. Bootstraps each account: live endpoint, credential refresh, device registration
//! 3. Holds one stream session per account with keepalive and reconnect
//! 4. Serves `/health` and `/metrics` when a status address is configured
//! 5. Appends each account's events to its own log file when `[logging]` is set

mod account;
mod account_log;
mod bootstrap;
mod config;
mod error;
mod metrics;
mod observer;
mod status;
mod supervisor;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use titan_api::AccountStore;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, reload};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::account::{AccountSpec, Shared, run_account};
use crate::account_log::AccountLogLayer;
use crate::config::Config;
use crate::status::{AppState, StatusBoard, build_router};
use crate::supervisor::{LaunchPlan, supervise};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support.
    // Account log files are swapped in once the config names a directory.
    let (account_logs, account_logs_handle) = reload::Layer::new(None::<AccountLogLayer>);
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .with(account_logs)
        .init();

    info!("starting titan-runner");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    let config = if cli_config_path.is_none() && !config_path.exists() {
        info!(path = %config_path.display(), "no config file, using defaults and environment");
        Config::from_env().context("invalid configuration from environment")?
    } else {
        info!(path = %config_path.display(), "loading configuration");
        Config::load(&config_path)
            .with_context(|| format!("failed to load config from {}", config_path.display()))?
    };

    info!(
        accounts = config.accounts.len(),
        endpoints = config.endpoints.len(),
        discovery = config.discovery.is_some(),
        launch = ?config.supervisor.launch,
        proxy_per_account = config.supervisor.proxy_per_account,
        "configuration loaded"
    );

    let store = match &config.store {
        Some(store) => Some(Arc::new(
            AccountStore::load(store.path.clone())
                .await
                .with_context(|| format!("failed to open account store {}", store.path.display()))?,
        )),
        None => None,
    };
    let shared = Arc::new(Shared::from_config(&config, store)?);

    let specs = AccountSpec::all_from_config(&config);
    let labels: Vec<String> = specs.iter().map(|s| s.label.clone()).collect();
    let (board, senders) = StatusBoard::new(&labels);

    // Flushed on drop at the end of main
    let _log_guards = match &config.logging {
        Some(logging) => {
            let (layer, guards) = AccountLogLayer::open(&logging.dir, &labels)?;
            account_logs_handle
                .reload(Some(layer))
                .context("failed to enable account log files")?;
            info!(dir = %logging.dir.display(), "account log files enabled");
            guards
        }
        None => Vec::new(),
    };

    let cancel = CancellationToken::new();

    let status_server = match &config.status {
        Some(status) => {
            let app = build_router(
                AppState {
                    board,
                    prometheus: prometheus_handle,
                    started_at: Instant::now(),
                },
                status.max_connections,
            );
            let listener = TcpListener::bind(status.listen_addr)
                .await
                .with_context(|| format!("failed to bind to {}", status.listen_addr))?;
            info!(addr = %status.listen_addr, "status endpoint listening");

            let shutdown = cancel.clone();
            Some(tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move { shutdown.cancelled().await })
                    .await
            }))
        }
        None => None,
    };

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_cancel.cancel();
    });

    let plan = LaunchPlan::from_config(&config.supervisor);
    let drain = Duration::from_secs(config.supervisor.drain_timeout_secs);
    let accounts: Vec<_> = labels
        .into_iter()
        .zip(specs.into_iter().zip(senders))
        .collect();

    let summary = supervise(accounts, &plan, &cancel, drain, |(spec, status)| {
        run_account(spec, shared.clone(), status, cancel.clone())
    })
    .await;

    info!(
        configured = config.accounts.len(),
        launched = summary.launched,
        failed = summary.failed,
        stopped = summary.stopped,
        "all accounts finished"
    );

    // Every account may have ended on its own; stop the status server too
    cancel.cancel();
    if let Some(server) = status_server {
        match tokio::time::timeout(drain, server).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => error!(error = %e, "status server error during shutdown"),
            Ok(Err(e)) => error!(error = %e, "status server task panicked"),
            Err(_) => warn!("status server did not stop within the drain timeout"),
        }
    }

    if summary.launched > 0 && summary.failed == summary.launched {
        anyhow::bail!("all {} launched accounts failed", summary.launched);
    }
    info!("shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
