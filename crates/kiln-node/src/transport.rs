//! HTTP/1.1 + JSON binding of the node protocol, over hyper.

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::client::NodeClient;
use crate::error::{NodeError, NodeResult};
use crate::protocol::{HealthReport, JobStatusReport, SubmitRequest, SubmitResponse};

/// Client for a single worker node at `host:port`.
#[derive(Debug, Clone)]
pub struct HttpNodeClient {
    address: String,
}

impl HttpNodeClient {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Issue one request on a fresh connection and collect the body.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> NodeResult<(StatusCode, Bytes)> {
        let uri = format!("http://{}{path}", self.address);

        let stream = tokio::net::TcpStream::connect(&self.address)
            .await
            .map_err(|e| NodeError::Unreachable(format!("{uri}: {e}")))?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| NodeError::Unreachable(format!("{uri}: handshake: {e}")))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let mut builder = Request::builder()
            .method(method)
            .uri(&uri)
            .header("host", &self.address)
            .header("user-agent", "kiln/0.1");
        if body.is_some() {
            builder = builder.header("content-type", "application/json");
        }
        let req = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| NodeError::Protocol(format!("{uri}: build request: {e}")))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| NodeError::Unreachable(format!("{uri}: {e}")))?;

        let status = resp.status();
        let bytes = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| NodeError::Unreachable(format!("{uri}: read body: {e}")))?
            .to_bytes();

        debug!(%uri, %status, "node responded");
        Ok((status, bytes))
    }

    /// Map non-2xx to `Rejected`, carrying the body as the reason.
    fn ensure_success(status: StatusCode, body: &Bytes) -> NodeResult<()> {
        if status.is_success() {
            return Ok(());
        }
        let reason = String::from_utf8_lossy(body).trim().to_string();
        Err(NodeError::Rejected {
            status: status.as_u16(),
            reason: if reason.is_empty() {
                status.canonical_reason().unwrap_or("unknown").to_string()
            } else {
                reason
            },
        })
    }

    fn parse<T: DeserializeOwned>(status: StatusCode, body: &Bytes) -> NodeResult<T> {
        Self::ensure_success(status, body)?;
        serde_json::from_slice(body).map_err(|e| NodeError::Protocol(e.to_string()))
    }
}

#[async_trait]
impl NodeClient for HttpNodeClient {
    async fn submit(&self, request: &SubmitRequest) -> NodeResult<String> {
        let body = serde_json::to_vec(request).map_err(|e| NodeError::Protocol(e.to_string()))?;
        let (status, bytes) = self.request(Method::POST, "/jobs", Some(body)).await?;
        let response: SubmitResponse = Self::parse(status, &bytes)?;
        Ok(response.job_id)
    }

    async fn status(&self, node_job_id: &str) -> NodeResult<JobStatusReport> {
        let (status, bytes) = self
            .request(Method::GET, &format!("/jobs/{node_job_id}"), None)
            .await?;
        Self::parse(status, &bytes)
    }

    async fn health(&self) -> NodeResult<HealthReport> {
        let (status, bytes) = self.request(Method::GET, "/health", None).await?;
        Self::parse(status, &bytes)
    }

    async fn cancel(&self, node_job_id: &str) -> NodeResult<()> {
        let (status, bytes) = self
            .request(Method::POST, &format!("/jobs/{node_job_id}/cancel"), None)
            .await?;
        Self::ensure_success(status, &bytes)
    }
}
