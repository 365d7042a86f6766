//! kiln-node — the node-facing side of Kiln.
//!
//! Every worker node exposes four operations: submit a job, query a job's
//! status, report its own health, and cancel a job. [`NodeClient`] is the
//! abstract contract the rest of Kiln depends on; [`HttpNodeClient`] binds
//! it to HTTP/1.1 + JSON.
//!
//! # Wire binding
//!
//! | Operation | Request | Response |
//! |---|---|---|
//! | submit | `POST /jobs` `{job_kind, parameters}` | `{job_id}` |
//! | status | `GET /jobs/{job_id}` | `{state, progress, result?, error?}` |
//! | cancel | `POST /jobs/{job_id}/cancel` | any 2xx |
//! | health | `GET /health` | `{status: ok\|busy\|degraded, load?}` |
//!
//! Clients never enforce deadlines themselves; callers wrap each call in
//! [`with_timeout`] so a stuck node surfaces as [`NodeError::Timeout`].

pub mod client;
pub mod error;
pub mod protocol;
pub mod transport;

pub use client::{HttpConnector, NodeClient, NodeClients, NodeConnector, with_timeout};
pub use error::{NodeError, NodeResult};
pub use transport::HttpNodeClient;
pub use protocol::*;
