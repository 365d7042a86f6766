//! Coordinator mode: registry, health monitor, dispatcher, and the REST
//! API in one process.
//!
//! Startup order:
//! 1. Load and validate `kiln.toml`
//! 2. Open the audit store
//! 3. Build the registry from the configured nodes (all start offline)
//! 4. Start one health probe loop per node
//! 5. Start the dispatcher and serve the API until Ctrl-C

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};

use kiln_api::ApiState;
use kiln_balancer::LoadBalancer;
use kiln_core::KilnConfig;
use kiln_dispatch::{Dispatcher, RetryPolicy};
use kiln_health::HealthMonitor;
use kiln_node::{HttpConnector, NodeClients};
use kiln_registry::NodeRegistry;
use kiln_state::StateStore;

/// Run the coordinator until Ctrl-C.
pub async fn run(config_path: PathBuf, port: u16, data_dir: PathBuf) -> anyhow::Result<()> {
    info!(config = ?config_path, "Kiln coordinator starting");

    let config = KilnConfig::from_file(&config_path)?;
    info!(
        nodes = config.nodes.len(),
        strategy = %config.balancer.strategy,
        "config loaded"
    );

    // ── Audit store ──────────────────────────────────────────────
    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("kiln.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "audit store opened");

    // ── Registry + health ────────────────────────────────────────
    let registry = Arc::new(NodeRegistry::new(config.nodes.clone())?.with_store(store.clone()));
    let clients = Arc::new(NodeClients::new(Arc::new(HttpConnector)));

    let health = Arc::new(HealthMonitor::new(
        Arc::clone(&registry),
        Arc::clone(&clients),
        config.health.clone(),
    ));
    health.start().await;
    info!(nodes = registry.len(), "health monitor started");

    // ── Dispatcher ───────────────────────────────────────────────
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&registry),
        clients,
        store,
        LoadBalancer::from_kind(config.balancer.strategy),
        RetryPolicy::from(&config.balancer),
        config.dispatch.clone(),
    ));

    // ── Shutdown signal ──────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reload_handle = tokio::spawn(watch_reload(
        config_path,
        Arc::clone(&registry),
        Arc::clone(&health),
        shutdown_rx,
    ));

    // ── API server ───────────────────────────────────────────────
    let state = ApiState::new(Arc::clone(&dispatcher)).with_health(Arc::clone(&health));
    let router = kiln_api::build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for Ctrl-C");
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    dispatcher.shutdown();
    health.stop_all().await;
    let _ = reload_handle.await;

    info!("Kiln coordinator stopped");
    Ok(())
}

/// Re-read the node list on SIGHUP and apply it to the registry.
#[cfg(unix)]
async fn watch_reload(
    config_path: PathBuf,
    registry: Arc<NodeRegistry>,
    health: Arc<HealthMonitor>,
    mut shutdown: watch::Receiver<bool>,
) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!(error = %e, "SIGHUP handler unavailable; config reload disabled");
            return;
        }
    };

    loop {
        tokio::select! {
            received = hangup.recv() => {
                if received.is_none() {
                    break;
                }
                if let Err(e) = reload(&config_path, &registry, &health).await {
                    error!(config = ?config_path, error = %e, "config reload failed; keeping current nodes");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(not(unix))]
async fn watch_reload(
    _config_path: PathBuf,
    _registry: Arc<NodeRegistry>,
    _health: Arc<HealthMonitor>,
    mut shutdown: watch::Receiver<bool>,
) {
    let _ = shutdown.changed().await;
}

/// Apply the node table of a freshly read config. Balancer, health, and
/// dispatch settings take effect on restart only.
async fn reload(
    config_path: &Path,
    registry: &NodeRegistry,
    health: &HealthMonitor,
) -> anyhow::Result<()> {
    let config = KilnConfig::from_file(config_path)?;
    let summary = registry.reload(config.nodes)?;
    health.sync().await;
    info!(
        added = summary.added.len(),
        updated = summary.updated.len(),
        removed = summary.removed.len(),
        "node table reloaded"
    );
    Ok(())
}
