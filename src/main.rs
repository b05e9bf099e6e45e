//! ping_exporter - ICMP reachability and latency exporter
//!
//! Pings every configured host on its own interval and exposes the results
//! for Prometheus to scrape.

mod cli;
mod config;
mod metrics;
mod probe;
mod scheduler;
mod web;

use clap::Parser;
use cli::Args;
use config::ConfigStore;
use metrics::PingMetrics;
use probe::Probe;
use scheduler::Scheduler;
use web::{AppState, Server};

use prometheus::Registry;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("ping_exporter={}", args.log_level))),
        )
        .init();

    args.validate()?;
    let addr = args.listen_addr()?;

    tracing::info!("Starting ping_exporter {}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let store = Arc::new(ConfigStore::new());
    store.reload(&args.config).map_err(|e| {
        tracing::error!("Failed to load config file {}: {}", args.config.display(), e);
        e
    })?;
    let config = store.snapshot();
    if config.host_count() == 0 {
        tracing::error!("No targets specified in config file");
        return Err("no targets specified in config file".into());
    }

    // Build one pinger per host
    let (instances, errors) = probe::build_instances(&config).await;
    for e in &errors {
        tracing::warn!("Skipping {}", e);
    }
    if instances.is_empty() {
        tracing::error!("None of the {} configured hosts could be probed", errors.len());
        return Err("no probe instances could be built".into());
    }

    // Wire events into metrics before any probe starts
    let registry = Registry::new();
    let ping_metrics = PingMetrics::new(&registry)?;
    metrics::register_build_info(&registry)?;
    for instance in &instances {
        metrics::attach(instance, &ping_metrics);
        tracing::debug!(
            "Probe {} ({}) -> {} every {:?}",
            instance.pinger.target(),
            instance.host.name,
            instance.pinger.ip(),
            instance.pinger.interval()
        );
    }

    let probes: Vec<Arc<dyn Probe>> = instances
        .iter()
        .map(|i| i.pinger.clone() as Arc<dyn Probe>)
        .collect();
    let scheduler = Scheduler::start(probes, args.interval);
    tracing::debug!("Probe start splay is {:?}", scheduler.splay());

    #[cfg(unix)]
    tokio::spawn(reload_on_hangup(store.clone(), args.config.clone()));

    // Serve until a shutdown signal arrives
    let server = Server::new(AppState {
        registry,
        metrics_path: args.metrics_path.clone(),
        config: store,
        config_path: args.config.clone(),
    });
    let served = server.start(addr, shutdown_signal()).await;
    if let Err(e) = &served {
        tracing::error!("Web server failed: {}", e);
    }

    tracing::info!("Stopping pingers");
    let stopped = scheduler.shutdown().await;
    served?;
    stopped.map_err(|e| {
        tracing::error!("Pingers failed: {}", e);
        e
    })?;

    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
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
    tracing::info!("Shutdown signal received");
}

/// Reload the config snapshot on every SIGHUP.
#[cfg(unix)]
async fn reload_on_hangup(store: Arc<ConfigStore>, path: std::path::PathBuf) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("Failed to listen for SIGHUP: {}", e);
            return;
        }
    };

    while hangup.recv().await.is_some() {
        match store.reload(&path) {
            Ok(()) => tracing::info!(
                "Reloaded config {} ({} hosts); running probes are unchanged until restart",
                path.display(),
                store.snapshot().host_count()
            ),
            Err(e) => tracing::error!("Failed to reload config {}: {}", path.display(), e),
        }
    }
}
