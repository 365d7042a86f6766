//! StateStore — redb-backed audit persistence for Kiln.
//!
//! Typed operations over node snapshots, task snapshots, and the
//! assignment ledger. The store supports both on-disk and in-memory
//! backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.open_table(TASKS).map_err(map_err!(Table))?;
        txn.open_table(ASSIGNMENTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn put<T: Serialize>(&self, def: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table.insert(key, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list<T: DeserializeOwned>(
        &self,
        def: JsonTable,
        prefix: &str,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let record: T =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(record);
            }
        }
        Ok(results)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Insert or replace the latest snapshot of a node.
    pub fn put_node(&self, record: &NodeRecord) -> StateResult<()> {
        self.put(NODES, &record.node.id, record)
    }

    pub fn get_node(&self, node_id: &str) -> StateResult<Option<NodeRecord>> {
        self.get(NODES, node_id)
    }

    pub fn list_nodes(&self) -> StateResult<Vec<NodeRecord>> {
        self.list(NODES, "")
    }

    // ── Tasks ──────────────────────────────────────────────────────

    /// Insert or replace the latest snapshot of a task.
    pub fn put_task(&self, record: &TaskRecord) -> StateResult<()> {
        self.put(TASKS, &record.id, record)
    }

    pub fn get_task(&self, task_id: &str) -> StateResult<Option<TaskRecord>> {
        self.get(TASKS, task_id)
    }

    pub fn list_tasks(&self) -> StateResult<Vec<TaskRecord>> {
        self.list(TASKS, "")
    }

    // ── Assignment ledger ──────────────────────────────────────────

    /// Append a new, unresolved attempt row.
    ///
    /// Fails with `AlreadyExists` if the row is already in the ledger.
    pub fn open_assignment(&self, row: &AssignmentRecord) -> StateResult<()> {
        let key = assignment_key(&row.task_id, row.attempt);
        let value = serde_json::to_vec(row).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ASSIGNMENTS).map_err(map_err!(Table))?;
            let exists = table.get(key.as_str()).map_err(map_err!(Read))?.is_some();
            if exists {
                return Err(StateError::AlreadyExists(key));
            }
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, node_id = %row.node_id, "assignment opened");
        Ok(())
    }

    /// Write the resolution of an attempt exactly once.
    ///
    /// The stored row must exist and still be unresolved; a resolved row
    /// is never overwritten.
    pub fn resolve_assignment(&self, row: &AssignmentRecord) -> StateResult<()> {
        let key = assignment_key(&row.task_id, row.attempt);
        let value = serde_json::to_vec(row).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ASSIGNMENTS).map_err(map_err!(Table))?;
            let existing: Option<AssignmentRecord> = match table
                .get(key.as_str())
                .map_err(map_err!(Read))?
            {
                Some(guard) => Some(
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                ),
                None => None,
            };
            match existing {
                None => return Err(StateError::NotFound(key)),
                Some(prev) if prev.resolution.is_some() => {
                    return Err(StateError::AlreadyResolved(key));
                }
                Some(_) => {}
            }
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, resolution = ?row.resolution, "assignment resolved");
        Ok(())
    }

    /// Update the node job id of a still-open attempt.
    pub fn annotate_assignment(&self, row: &AssignmentRecord) -> StateResult<()> {
        if row.resolution.is_some() {
            return self.resolve_assignment(row);
        }
        let key = assignment_key(&row.task_id, row.attempt);
        match self.get::<AssignmentRecord>(ASSIGNMENTS, &key)? {
            Some(prev) if prev.resolution.is_some() => Err(StateError::AlreadyResolved(key)),
            Some(_) => self.put(ASSIGNMENTS, &key, row),
            None => Err(StateError::NotFound(key)),
        }
    }

    /// All attempts of a task, in attempt order.
    pub fn list_assignments(&self, task_id: &str) -> StateResult<Vec<AssignmentRecord>> {
        let prefix = format!("{task_id}:");
        let rows: Vec<AssignmentRecord> = self.list(ASSIGNMENTS, &prefix)?;
        // A task id containing ':' can share a prefix with another task.
        Ok(rows.into_iter().filter(|r| r.task_id == task_id).collect())
    }

    /// Every ledger row across all tasks.
    pub fn list_all_assignments(&self) -> StateResult<Vec<AssignmentRecord>> {
        self.list(ASSIGNMENTS, "")
    }
}
