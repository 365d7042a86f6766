//! Health monitor — one background probe task per registered node.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kiln_core::{HealthSettings, NodeId};
use kiln_node::NodeClients;
use kiln_registry::NodeRegistry;

use crate::checker::{HealthTracker, ProbeOutcome, Verdict, probe};

/// Per-node monitor state.
struct MonitorSlot {
    handle: JoinHandle<()>,
    token: CancellationToken,
    /// Address the loop was started for.
    address: String,
}

/// Runs heartbeat probes for every node in the registry.
pub struct HealthMonitor {
    registry: Arc<NodeRegistry>,
    clients: Arc<NodeClients>,
    settings: HealthSettings,
    /// Parent of every per-node token.
    root: CancellationToken,
    monitors: Arc<RwLock<HashMap<NodeId, MonitorSlot>>>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<NodeRegistry>,
        clients: Arc<NodeClients>,
        settings: HealthSettings,
    ) -> Self {
        Self {
            registry,
            clients,
            settings,
            root: CancellationToken::new(),
            monitors: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start (or restart) probing every registered node, staggering first
    /// probes evenly across one interval.
    pub async fn start(&self) {
        let nodes = self.registry.snapshot();
        let count = nodes.len() as u32;
        for (idx, node) in nodes.iter().enumerate() {
            let delay = stagger(self.settings.interval, idx as u32, count);
            self.start_monitor(&node.id, &node.address, delay).await;
        }
        info!(nodes = count, interval_ms = self.settings.interval.as_millis() as u64, "health monitor started");
    }

    /// Bring the probe set in line with the registry after a reload or a
    /// registration: new nodes get a loop, removed nodes lose theirs, and
    /// nodes whose address changed are restarted.
    pub async fn sync(&self) {
        let nodes = self.registry.snapshot();

        let stale: Vec<NodeId> = {
            let monitors = self.monitors.read().await;
            monitors
                .keys()
                .filter(|id| !nodes.iter().any(|n| &n.id == *id))
                .cloned()
                .collect()
        };
        for id in stale {
            self.stop_monitor(&id).await;
        }

        let count = nodes.len() as u32;
        for (idx, node) in nodes.iter().enumerate() {
            let current = {
                let monitors = self.monitors.read().await;
                monitors.get(&node.id).map(|slot| slot.address.clone())
            };
            if current.as_deref() != Some(node.address.as_str()) {
                let delay = stagger(self.settings.interval, idx as u32, count);
                self.start_monitor(&node.id, &node.address, delay).await;
            }
        }
    }

    /// Start probing one node after `delay`, replacing any existing loop.
    pub async fn start_monitor(&self, node_id: &str, address: &str, delay: Duration) {
        let token = self.root.child_token();
        let handle = tokio::spawn(run_probe_loop(
            node_id.to_string(),
            Arc::clone(&self.registry),
            Arc::clone(&self.clients),
            self.settings.clone(),
            token.clone(),
            delay,
        ));

        let mut monitors = self.monitors.write().await;
        if let Some(old) = monitors.insert(
            node_id.to_string(),
            MonitorSlot {
                handle,
                token,
                address: address.to_string(),
            },
        ) {
            old.token.cancel();
            old.handle.abort();
        }
        debug!(%node_id, %address, delay_ms = delay.as_millis() as u64, "probe loop started");
    }

    pub async fn stop_monitor(&self, node_id: &str) {
        let mut monitors = self.monitors.write().await;
        if let Some(slot) = monitors.remove(node_id) {
            slot.token.cancel();
            slot.handle.abort();
            self.clients.forget(node_id);
            info!(%node_id, "probe loop stopped");
        }
    }

    /// Stop every loop (graceful shutdown).
    pub async fn stop_all(&self) {
        self.root.cancel();
        let mut monitors = self.monitors.write().await;
        for (id, slot) in monitors.drain() {
            slot.handle.abort();
            debug!(node_id = %id, "probe loop stopped");
        }
        info!("health monitor stopped");
    }

    pub async fn active_monitors(&self) -> Vec<NodeId> {
        let monitors = self.monitors.read().await;
        let mut ids: Vec<NodeId> = monitors.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn is_monitoring(&self, node_id: &str) -> bool {
        let monitors = self.monitors.read().await;
        monitors.contains_key(node_id)
    }
}

/// Offset of the first probe of node `idx` out of `count`.
fn stagger(interval: Duration, idx: u32, count: u32) -> Duration {
    if count == 0 {
        return Duration::ZERO;
    }
    interval * idx / count
}

/// The probe loop for a single node. Probe failures are recorded and the
/// loop carries on; only cancellation or removal of the node ends it.
async fn run_probe_loop(
    node_id: NodeId,
    registry: Arc<NodeRegistry>,
    clients: Arc<NodeClients>,
    settings: HealthSettings,
    token: CancellationToken,
    delay: Duration,
) {
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = token.cancelled() => return,
    }

    let mut ticker = tokio::time::interval(settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let last_heartbeat = registry.get(&node_id).ok().and_then(|node| node.last_heartbeat);
    let mut tracker = HealthTracker::resuming(settings.heartbeat_timeout, last_heartbeat);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = token.cancelled() => break,
        }

        let node = match registry.get(&node_id) {
            Ok(node) => node,
            Err(_) => {
                debug!(%node_id, "node left the registry; probe loop exiting");
                break;
            }
        };
        let client = clients.client_for(&node_id, &node.address);

        let outcome = tokio::select! {
            outcome = probe(client.as_ref(), settings.timeout) => outcome,
            _ = token.cancelled() => break,
        };

        if let ProbeOutcome::Failed(e) = &outcome {
            debug!(%node_id, error = %e, "health probe failed");
        }

        let recorded = match tracker.record(&outcome) {
            Verdict::Heartbeat(status) => registry.record_heartbeat(&node_id, status).map(|_| ()),
            Verdict::Missed { mark_offline } => registry
                .record_missed_heartbeat(&node_id, mark_offline)
                .map(|(_, failures)| {
                    if failures > 1 && !mark_offline {
                        warn!(%node_id, failures, "node missing heartbeats");
                    }
                }),
        };
        if recorded.is_err() {
            debug!(%node_id, "node left the registry; probe loop exiting");
            break;
        }
    }
}
