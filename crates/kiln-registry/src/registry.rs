//! The node registry.
//!
//! Nodes are kept in registry order (configuration order, then dynamic
//! registrations in arrival order). Each node has its own `Mutex`; the
//! outer `RwLock` only guards membership and is write-locked by
//! `register` and `reload` alone.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use kiln_core::{NodeDescriptor, NodeId, NodeSnapshot, NodeStatus, epoch_millis, validate_node};
use kiln_state::{NodeRecord, StateStore};

use crate::error::{RegistryError, RegistryResult};

/// Previous and current status of a node after a status write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub previous: NodeStatus,
    pub current: NodeStatus,
}

impl StatusChange {
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }
}

/// Outcome of [`NodeRegistry::reload`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    pub added: Vec<NodeId>,
    pub updated: Vec<NodeId>,
    pub removed: Vec<NodeId>,
}

/// One load slot reserved with [`NodeRegistry::reserve`].
///
/// A node removed by `reload` and later re-added is a new incarnation
/// with its own counter; leases taken on the old one no longer release
/// anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotLease {
    node_id: NodeId,
    incarnation: u64,
}

impl SlotLease {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

struct NodeSlot {
    descriptor: NodeDescriptor,
    status: NodeStatus,
    current_load: u32,
    /// Effective capacity. Differs from `descriptor.max_concurrent` only
    /// while a reload that shrank capacity waits for load to drain.
    max_concurrent: u32,
    last_heartbeat: Option<u64>,
    consecutive_failures: u32,
}

impl NodeSlot {
    fn new(descriptor: NodeDescriptor) -> Self {
        Self {
            max_concurrent: descriptor.max_concurrent,
            descriptor,
            status: NodeStatus::Offline,
            current_load: 0,
            last_heartbeat: None,
            consecutive_failures: 0,
        }
    }

    fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            id: self.descriptor.id.clone(),
            address: self.descriptor.address(),
            max_concurrent: self.max_concurrent,
            current_load: self.current_load,
            capabilities: self.descriptor.capabilities.clone(),
            status: self.status,
            metadata: self.descriptor.metadata.clone(),
            last_heartbeat: self.last_heartbeat,
            consecutive_failures: self.consecutive_failures,
        }
    }

    /// Move effective capacity toward the configured one, never below load.
    fn settle_capacity(&mut self) {
        self.max_concurrent = self.descriptor.max_concurrent.max(self.current_load);
    }
}

struct NodeEntry {
    id: NodeId,
    incarnation: u64,
    slot: Mutex<NodeSlot>,
}

impl NodeEntry {
    fn lock(&self) -> MutexGuard<'_, NodeSlot> {
        // Every critical section leaves the slot consistent.
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Authoritative in-memory node pool.
pub struct NodeRegistry {
    nodes: RwLock<Vec<Arc<NodeEntry>>>,
    incarnations: AtomicU64,
    released: Notify,
    store: Option<StateStore>,
}

impl NodeRegistry {
    /// Seed the registry from static configuration. Every node starts
    /// `offline` until its first successful health probe.
    pub fn new(descriptors: Vec<NodeDescriptor>) -> RegistryResult<Self> {
        let registry = Self {
            nodes: RwLock::new(Vec::new()),
            incarnations: AtomicU64::new(0),
            released: Notify::new(),
            store: None,
        };
        for descriptor in descriptors {
            registry.register(descriptor)?;
        }
        Ok(registry)
    }

    /// Attach an audit store; current snapshots are written immediately.
    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        for node in self.snapshot() {
            self.persist(&node);
        }
        self
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Snapshots of nodes matching the optional filters, in registry order.
    pub fn list(&self, capability: Option<&str>, status: Option<NodeStatus>) -> Vec<NodeSnapshot> {
        self.entries()
            .iter()
            .map(|entry| entry.lock().snapshot())
            .filter(|node| capability.is_none_or(|kind| node.can_run(kind)))
            .filter(|node| status.is_none_or(|s| node.status == s))
            .collect()
    }

    /// Snapshots of every node, in registry order.
    pub fn snapshot(&self) -> Vec<NodeSnapshot> {
        self.list(None, None)
    }

    pub fn get(&self, node_id: &str) -> RegistryResult<NodeSnapshot> {
        Ok(self.entry(node_id)?.lock().snapshot())
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.entry(node_id).is_ok()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ── Mutations ──────────────────────────────────────────────────

    /// Atomically add `delta` to a node's load.
    ///
    /// An increment that would exceed capacity fails with
    /// `CapacityExceeded`; a decrement below zero fails with
    /// `LoadUnderflow`. Neither is clamped. Returns the new load.
    pub fn adjust_load(&self, node_id: &str, delta: i32) -> RegistryResult<u32> {
        let entry = self.entry(node_id)?;
        self.adjust(&entry, delta)
    }

    /// Reserve one slot on a node, as `adjust_load(+1)`.
    pub fn reserve(&self, node_id: &str) -> RegistryResult<SlotLease> {
        let entry = self.entry(node_id)?;
        self.adjust(&entry, 1)?;
        Ok(SlotLease {
            node_id: entry.id.clone(),
            incarnation: entry.incarnation,
        })
    }

    /// Give back a reserved slot. Fails with `StaleLease`, changing
    /// nothing, when the node was removed (or removed and re-added) since
    /// the lease was taken. Returns the new load.
    pub fn release(&self, lease: SlotLease) -> RegistryResult<u32> {
        let entry = match self.entry(&lease.node_id) {
            Ok(entry) if entry.incarnation == lease.incarnation => entry,
            _ => {
                return Err(RegistryError::StaleLease {
                    node_id: lease.node_id,
                });
            }
        };
        self.adjust(&entry, -1)
    }

    /// Set a node's status unconditionally.
    pub fn update_status(&self, node_id: &str, status: NodeStatus) -> RegistryResult<StatusChange> {
        let entry = self.entry(node_id)?;
        let (change, snapshot) = {
            let mut slot = entry.lock();
            let previous = slot.status;
            slot.status = status;
            (
                StatusChange {
                    previous,
                    current: status,
                },
                slot.snapshot(),
            )
        };
        self.after_status_write(&snapshot, change);
        Ok(change)
    }

    /// Record a successful probe: heartbeat stamped, failure count reset,
    /// status set to `reported` unless the node is in maintenance.
    pub fn record_heartbeat(
        &self,
        node_id: &str,
        reported: NodeStatus,
    ) -> RegistryResult<StatusChange> {
        let entry = self.entry(node_id)?;
        let (change, snapshot) = {
            let mut slot = entry.lock();
            let previous = slot.status;
            slot.last_heartbeat = Some(epoch_millis());
            slot.consecutive_failures = 0;
            if previous != NodeStatus::Maintenance {
                slot.status = reported;
            }
            (
                StatusChange {
                    previous,
                    current: slot.status,
                },
                slot.snapshot(),
            )
        };
        self.after_status_write(&snapshot, change);
        Ok(change)
    }

    /// Record a failed probe. With `mark_offline` the node goes `offline`
    /// (maintenance is kept). Returns the status change and the new
    /// consecutive failure count.
    pub fn record_missed_heartbeat(
        &self,
        node_id: &str,
        mark_offline: bool,
    ) -> RegistryResult<(StatusChange, u32)> {
        let entry = self.entry(node_id)?;
        let (change, snapshot) = {
            let mut slot = entry.lock();
            let previous = slot.status;
            slot.consecutive_failures = slot.consecutive_failures.saturating_add(1);
            if mark_offline && previous != NodeStatus::Maintenance {
                slot.status = NodeStatus::Offline;
            }
            (
                StatusChange {
                    previous,
                    current: slot.status,
                },
                slot.snapshot(),
            )
        };
        self.after_status_write(&snapshot, change);
        Ok((change, snapshot.consecutive_failures))
    }

    /// Enter or leave maintenance. Leaving sets the node `offline`; the
    /// next successful probe brings it back.
    pub fn set_maintenance(&self, node_id: &str, enabled: bool) -> RegistryResult<NodeSnapshot> {
        let entry = self.entry(node_id)?;
        let (change, snapshot) = {
            let mut slot = entry.lock();
            let previous = slot.status;
            if enabled {
                slot.status = NodeStatus::Maintenance;
            } else if previous == NodeStatus::Maintenance {
                slot.status = NodeStatus::Offline;
            }
            (
                StatusChange {
                    previous,
                    current: slot.status,
                },
                slot.snapshot(),
            )
        };
        self.after_status_write(&snapshot, change);
        Ok(snapshot)
    }

    /// Add a node at runtime. Duplicate ids are rejected.
    pub fn register(&self, descriptor: NodeDescriptor) -> RegistryResult<NodeSnapshot> {
        validate_node(&descriptor).map_err(|e| RegistryError::Invalid(e.to_string()))?;

        let snapshot = {
            let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
            if nodes.iter().any(|entry| entry.id == descriptor.id) {
                return Err(RegistryError::AlreadyRegistered(descriptor.id));
            }
            let entry = self.new_entry(descriptor);
            let snapshot = entry.lock().snapshot();
            nodes.push(entry);
            snapshot
        };

        info!(node_id = %snapshot.id, address = %snapshot.address, max = snapshot.max_concurrent, "node registered");
        self.persist(&snapshot);
        Ok(snapshot)
    }

    /// Apply a new node list.
    ///
    /// New ids are added, known ids get their static fields replaced while
    /// keeping load, status, and heartbeat metadata, and ids missing from
    /// `descriptors` are removed. Registry order follows `descriptors`.
    pub fn reload(&self, descriptors: Vec<NodeDescriptor>) -> RegistryResult<ReloadSummary> {
        let mut seen = HashSet::new();
        for descriptor in &descriptors {
            validate_node(descriptor).map_err(|e| RegistryError::Invalid(e.to_string()))?;
            if !seen.insert(descriptor.id.clone()) {
                return Err(RegistryError::Invalid(format!(
                    "duplicate node id in reload: {}",
                    descriptor.id
                )));
            }
        }

        let mut summary = ReloadSummary::default();
        let mut touched = Vec::new();
        {
            let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
            let mut next = Vec::with_capacity(descriptors.len());
            for descriptor in descriptors {
                match nodes.iter().find(|entry| entry.id == descriptor.id) {
                    Some(entry) => {
                        let mut slot = entry.lock();
                        if slot.descriptor != descriptor {
                            if descriptor.max_concurrent < slot.current_load {
                                warn!(
                                    node_id = %entry.id,
                                    load = slot.current_load,
                                    max = descriptor.max_concurrent,
                                    "capacity shrinks below current load; applying as jobs drain"
                                );
                            }
                            slot.descriptor = descriptor;
                            slot.settle_capacity();
                            summary.updated.push(entry.id.clone());
                            touched.push(slot.snapshot());
                        }
                        drop(slot);
                        next.push(Arc::clone(entry));
                    }
                    None => {
                        let entry = self.new_entry(descriptor);
                        summary.added.push(entry.id.clone());
                        touched.push(entry.lock().snapshot());
                        next.push(entry);
                    }
                }
            }
            summary.removed = nodes
                .iter()
                .filter(|entry| !seen.contains(&entry.id))
                .map(|entry| entry.id.clone())
                .collect();
            *nodes = next;
        }

        for snapshot in &touched {
            self.persist(snapshot);
        }
        info!(
            added = summary.added.len(),
            updated = summary.updated.len(),
            removed = summary.removed.len(),
            "node registry reloaded"
        );
        // Capacity may have grown.
        self.released.notify_waiters();
        Ok(summary)
    }

    /// Resolves on the next load release (or capacity-changing reload).
    ///
    /// Only waiters already parked when the release happens are woken,
    /// so callers pair this with a timer.
    pub async fn capacity_released(&self) {
        self.released.notified().await;
    }

    // ── Internals ──────────────────────────────────────────────────

    fn adjust(&self, entry: &NodeEntry, delta: i32) -> RegistryResult<u32> {
        let snapshot = {
            let mut slot = entry.lock();
            let next = i64::from(slot.current_load) + i64::from(delta);
            if next < 0 {
                return Err(RegistryError::LoadUnderflow {
                    node_id: entry.id.clone(),
                    current_load: slot.current_load,
                    delta,
                });
            }
            if delta > 0 && next > i64::from(slot.max_concurrent) {
                return Err(RegistryError::CapacityExceeded {
                    node_id: entry.id.clone(),
                    current_load: slot.current_load,
                    max_concurrent: slot.max_concurrent,
                });
            }
            slot.current_load = next as u32;
            if delta < 0 {
                slot.settle_capacity();
            }
            slot.snapshot()
        };

        debug!(
            node_id = %snapshot.id,
            delta,
            load = snapshot.current_load,
            max = snapshot.max_concurrent,
            "load adjusted"
        );
        self.persist(&snapshot);
        if delta < 0 {
            self.released.notify_waiters();
        }
        Ok(snapshot.current_load)
    }

    fn new_entry(&self, descriptor: NodeDescriptor) -> Arc<NodeEntry> {
        Arc::new(NodeEntry {
            id: descriptor.id.clone(),
            incarnation: self.incarnations.fetch_add(1, Ordering::Relaxed),
            slot: Mutex::new(NodeSlot::new(descriptor)),
        })
    }

    fn entries(&self) -> Vec<Arc<NodeEntry>> {
        self.nodes.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn entry(&self, node_id: &str) -> RegistryResult<Arc<NodeEntry>> {
        self.nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|entry| entry.id == node_id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(node_id.to_string()))
    }

    fn after_status_write(&self, snapshot: &NodeSnapshot, change: StatusChange) {
        if change.changed() {
            match change.current {
                NodeStatus::Offline | NodeStatus::Error => {
                    warn!(node_id = %snapshot.id, from = %change.previous, to = %change.current, "node status changed")
                }
                _ => {
                    info!(node_id = %snapshot.id, from = %change.previous, to = %change.current, "node status changed")
                }
            }
        }
        self.persist(snapshot);
    }

    fn persist(&self, snapshot: &NodeSnapshot) {
        if let Some(store) = &self.store {
            if let Err(e) = store.put_node(&NodeRecord::from_snapshot(snapshot.clone())) {
                error!(node_id = %snapshot.id, error = %e, "failed to write node snapshot");
            }
        }
    }
}
