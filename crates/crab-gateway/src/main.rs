//! `crabd` — the crab monitoring daemon.
//!
//! One process, three long-lived tasks: the HTTP server (client protocol
//! plus read API), the liveness monitor, and the notification engine.
//! They share nothing but the store and one bounded channel.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crab_core::CrabConfig;
use crab_gateway::{app, pidfile};
use crab_monitor::{MonitorConfig, MonitorEngine, FANOUT_BUFFER};
use crab_notify::{NotifyConfig, NotifyEngine, TransportRegistry};
use crab_store::CrabStore;

/// Cadence of the background retention sweep, when retention is configured.
const RETENTION_SWEEP_SECS: u64 = 6 * 3600;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "crab_gateway=info,tower_http=info".into()),
        )
        .init();

    // Config problems are the one fatal startup error class.
    let config_path = std::env::args().nth(1);
    let config = CrabConfig::load(config_path.as_deref())?;

    let pid_path = PathBuf::from(&config.crab.home).join("crabd.pid");
    let pid_file = pidfile::PidFile::acquire(pid_path)?;

    // Store: main database plus the optional blob backend.
    let output_store = match &config.outputstore {
        Some(section) => {
            info!(path = %section.path, "opening output store");
            Some(crab_store::open_output_store(section)?)
        }
        None => None,
    };
    info!(path = %config.store.path, "opening SQLite database");
    let store = Arc::new(CrabStore::open(&config.store.path, output_store)?);

    // Monitor -> notifier fan-out and the daemon-wide shutdown signal.
    let (event_tx, event_rx) = tokio::sync::mpsc::channel(FANOUT_BUFFER);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let monitor_config = MonitorConfig::from_config(&config)?;
    let monitor = MonitorEngine::new(Arc::clone(&store), monitor_config.clone(), event_tx);
    let status = monitor.status_map();

    let registry = TransportRegistry::from_config(&config.transport);
    if registry.is_empty() {
        warn!("no transports configured; alerts will not be delivered");
    }
    let notifier = NotifyEngine::new(
        Arc::clone(&store),
        Arc::new(registry),
        NotifyConfig::from_config(&config)?,
    );

    let monitor_task = tokio::spawn(monitor.run(shutdown_rx.clone()));
    let notifier_task = tokio::spawn(notifier.run(event_rx, shutdown_rx.clone()));

    if let Some(days) = config.store.retention_days {
        tokio::spawn(retention_loop(Arc::clone(&store), days, shutdown_rx.clone()));
    }

    let feed_enabled = config.base_url().is_some();
    if !feed_enabled {
        info!("no base_url configured; /feed disabled");
    }
    let addr: SocketAddr = format!("{}:{}", config.crab.bind, config.crab.port).parse()?;
    let state = Arc::new(app::AppState {
        config,
        store,
        status,
        defaults: monitor_config,
        feed_enabled,
        started_at: Utc::now(),
    });
    let router = app::build_router(state);

    info!("crab daemon listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // HTTP has drained; stop the loops and let the notifier flush.
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    if let Err(e) = monitor_task.await {
        error!("monitor task panicked: {e}");
    }
    if let Err(e) = notifier_task.await {
        error!("notifier task panicked: {e}");
    }

    pid_file.release();
    Ok(())
}

/// Resolves when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("cannot listen for SIGINT: {e}");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Background retention sweep: idempotent, per the configured window.
async fn retention_loop(
    store: Arc<CrabStore>,
    retention_days: u32,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    info!(retention_days, "event retention enabled");
    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs(RETENTION_SWEEP_SECS));

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match store.cleanup_events(retention_days, Utc::now()) {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, "retention sweep removed old events"),
                    Err(e) => error!("retention sweep failed: {e}"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
