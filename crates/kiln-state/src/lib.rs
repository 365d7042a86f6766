//! kiln-state — embedded audit store for Kiln.
//!
//! Backed by [redb](https://docs.rs/redb). Records node status snapshots,
//! task snapshots, and the append-only assignment ledger for observability
//! and crash diagnostics. Nothing here is read back to rebuild runtime
//! state; the registry reseeds from configuration on restart.
//!
//! # Architecture
//!
//! All records are JSON-serialized into redb's `&[u8]` value columns.
//! Assignment rows use the composite key `{task_id}:{attempt:06}` so a
//! task's attempts sort in order.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
