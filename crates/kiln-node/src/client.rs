//! The `NodeClient` contract and the per-node client cache.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{NodeError, NodeResult};
use crate::protocol::{HealthReport, JobStatusReport, SubmitRequest};
use crate::transport::HttpNodeClient;

/// Operations Kiln needs from a worker node.
///
/// Implementations report failures as [`NodeError`]; they do not apply
/// deadlines (see [`with_timeout`]).
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Submit a job; returns the node's job id.
    async fn submit(&self, request: &SubmitRequest) -> NodeResult<String>;

    async fn status(&self, node_job_id: &str) -> NodeResult<JobStatusReport>;

    async fn health(&self) -> NodeResult<HealthReport>;

    /// Ask the node to drop a queued or running job.
    async fn cancel(&self, node_job_id: &str) -> NodeResult<()>;
}

/// Builds a client for a node address.
pub trait NodeConnector: Send + Sync {
    fn connect(&self, node_id: &str, address: &str) -> Arc<dyn NodeClient>;
}

/// Connector producing [`HttpNodeClient`]s.
#[derive(Debug, Clone, Default)]
pub struct HttpConnector;

impl NodeConnector for HttpConnector {
    fn connect(&self, _node_id: &str, address: &str) -> Arc<dyn NodeClient> {
        Arc::new(HttpNodeClient::new(address))
    }
}

/// Run a node call with a deadline; elapsing maps to [`NodeError::Timeout`].
pub async fn with_timeout<T, F>(operation: &str, timeout: Duration, call: F) -> NodeResult<T>
where
    F: Future<Output = NodeResult<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(NodeError::Timeout(format!(
            "{operation} exceeded {}ms",
            timeout.as_millis()
        ))),
    }
}

struct CachedClient {
    address: String,
    client: Arc<dyn NodeClient>,
}

/// Lazily-built clients, one per node.
///
/// A node whose address changed (after a config reload) gets a fresh
/// client on next use.
pub struct NodeClients {
    connector: Arc<dyn NodeConnector>,
    clients: RwLock<HashMap<String, CachedClient>>,
}

impl NodeClients {
    pub fn new(connector: Arc<dyn NodeConnector>) -> Self {
        Self {
            connector,
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Client for `node_id` at `address`, creating it if needed.
    pub fn client_for(&self, node_id: &str, address: &str) -> Arc<dyn NodeClient> {
        {
            let clients = self.clients.read().unwrap_or_else(|e| e.into_inner());
            if let Some(cached) = clients.get(node_id) {
                if cached.address == address {
                    return Arc::clone(&cached.client);
                }
            }
        }

        let client = self.connector.connect(node_id, address);
        let mut clients = self.clients.write().unwrap_or_else(|e| e.into_inner());
        clients.insert(
            node_id.to_string(),
            CachedClient {
                address: address.to_string(),
                client: Arc::clone(&client),
            },
        );
        debug!(%node_id, %address, "node client created");
        client
    }

    /// Drop the cached client of a removed node.
    pub fn forget(&self, node_id: &str) {
        let mut clients = self.clients.write().unwrap_or_else(|e| e.into_inner());
        clients.remove(node_id);
    }
}
