//! redb table definitions for the Kiln state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized records).

use redb::TableDefinition;

/// `&str` keys, JSON-encoded `&[u8]` values.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Latest node snapshot keyed by `{node_id}`.
pub const NODES: JsonTable = TableDefinition::new("nodes");

/// Latest task snapshot keyed by `{task_id}`.
pub const TASKS: JsonTable = TableDefinition::new("tasks");

/// Assignment ledger keyed by `{task_id}:{attempt:06}`.
pub const ASSIGNMENTS: JsonTable = TableDefinition::new("assignments");
