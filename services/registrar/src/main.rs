//! subproxy registrar
//!
//! Publishes the routing declarations of running containers to etcd so the
//! reverse proxy can build its routing table from them.
//!
//! ## Modes
//!
//! - **once**: a single reconciliation pass, then exit
//! - **poll**: a pass on start and then on a fixed interval
//! - **events**: a pass on start and then on every container network event
//!
//! Daemon modes run until SIGINT/SIGTERM; a pass in progress always completes.

use std::sync::Arc;

use anyhow::{Context, Result};
use subproxy_registrar::config::{Config, Mode};
use subproxy_registrar::{
    run_daemon, trigger, DockerClient, EtcdClient, KeyValueStore, Reconciler, ReconcilerConfig,
    TriggerMode,
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    // Initialize tracing (prefer RUST_LOG, fallback to --log-level)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting subproxy registrar");
    info!(
        mode = ?config.mode,
        interval_secs = config.interval.as_secs(),
        "Configuration loaded"
    );

    let store = Arc::new(
        EtcdClient::new(config.endpoints.clone(), config.store_timeout)
            .context("Failed to build etcd client")?,
    );

    // An unreachable store is a configuration problem; fail before any loop.
    match store.get(config.namespace.as_str()).await {
        Ok(_) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e).context("etcd is unreachable at startup"),
    }

    let docker = Arc::new(DockerClient::new(&config.docker_socket, config.runtime_timeout));
    let reconciler = Arc::new(Reconciler::new(
        docker.clone(),
        store.clone(),
        ReconcilerConfig {
            namespace: config.namespace.clone(),
            layout: config.layout,
        },
    ));

    info!(
        endpoints = ?store.endpoints().iter().map(|u| u.as_str()).collect::<Vec<_>>(),
        docker_socket = docker.socket_path(),
        namespace = %reconciler.config().namespace,
        layout = %reconciler.config().layout,
        "Registrar ready"
    );

    let mode = match config.mode {
        Mode::Once => {
            let report = trigger::run_once(&reconciler)
                .await
                .context("Reconciliation pass failed")?;
            info!(
                created = report.created,
                updated = report.updated,
                deleted = report.deleted,
                unchanged = report.unchanged,
                "Single pass complete"
            );
            return Ok(());
        }
        Mode::Poll => TriggerMode::Polling(config.interval),
        Mode::Events => TriggerMode::Events {
            events: docker,
            filter: config.event_filter.clone(),
        },
    };

    let stats = run_daemon(reconciler, mode, shutdown_signal()).await?;

    info!(passes = stats.passes, failed = stats.failed, "Registrar shutdown complete");
    Ok(())
}

/// Resolve on SIGINT, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
