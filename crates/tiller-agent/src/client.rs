//! HTTP agent client.
//!
//! Opens one connection per call (the agent is low-traffic and the
//! management network is flat), signs the body with HMAC-SHA256, and
//! wraps the whole exchange in a per-call timeout. Transient failures
//! get a small bounded retry budget with doubling backoff.

use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use tiller_store::{AgentConfig, AgentDiagnostics, AgentStatus};

use crate::error::AgentError;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the request MAC.
pub const MAC_HEADER: &str = "x-tiller-mac";

/// The agent protocol surface used by task nodes and the failover
/// fast path. Implementations must be stateless per call.
#[async_trait]
pub trait AgentChannel: Send + Sync {
    /// Push the initial configuration to a freshly booted amphora.
    async fn provision(&self, endpoint: &str, config: &AgentConfig) -> Result<(), AgentError>;

    /// Push an updated configuration to a running amphora.
    async fn update(&self, endpoint: &str, config: &AgentConfig) -> Result<(), AgentError>;

    /// Fetch the agent's current status document.
    async fn get_status(&self, endpoint: &str) -> Result<AgentStatus, AgentError>;

    /// Fetch the agent's diagnostics document.
    async fn get_diagnostics(&self, endpoint: &str) -> Result<AgentDiagnostics, AgentError>;
}

/// Stable digest of a configuration document.
///
/// The agent uses this to recognize replayed pushes; tests use it to
/// assert idempotence.
pub fn config_digest(config: &AgentConfig) -> String {
    // serde_json serialization of the struct is deterministic: field
    // order follows the struct definition.
    let bytes = serde_json::to_vec(config).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}

/// HTTP implementation of [`AgentChannel`].
pub struct HttpAgentClient {
    /// Pre-shared key for request signing.
    secret: Vec<u8>,
    /// Per-call timeout covering connect + exchange.
    timeout: Duration,
    /// Bounded retry budget for transient failures.
    max_retries: u32,
    /// Initial backoff between retries; doubles per attempt.
    retry_backoff: Duration,
}

impl HttpAgentClient {
    /// Create a client with default timeouts (5s call, 3 retries).
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            timeout: Duration::from_secs(5),
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }

    /// Override the per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the transient retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sign a request body with the pre-shared key.
    fn sign(&self, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("hmac accepts any key length");
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Issue one request with the transient retry loop around it.
    async fn request(
        &self,
        method: &str,
        endpoint: &str,
        path: &str,
        body: Vec<u8>,
    ) -> Result<Vec<u8>, AgentError> {
        let mut backoff = self.retry_backoff;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.request_once(method, endpoint, path, &body).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() && attempt <= self.max_retries => {
                    debug!(%endpoint, %path, attempt, error = %e, "transient agent failure, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    if e.is_transient() {
                        warn!(%endpoint, %path, attempts = attempt, "agent retries exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }

    /// One signed HTTP exchange against the agent, under the call timeout.
    async fn request_once(
        &self,
        method: &str,
        endpoint: &str,
        path: &str,
        body: &[u8],
    ) -> Result<Vec<u8>, AgentError> {
        let exchange = async {
            let stream = tokio::net::TcpStream::connect(endpoint)
                .await
                .map_err(|e| AgentError::Transport {
                    endpoint: endpoint.to_string(),
                    reason: e.to_string(),
                })?;

            let io = hyper_util::rt::TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| AgentError::Transport {
                    endpoint: endpoint.to_string(),
                    reason: e.to_string(),
                })?;

            // Drive the connection in the background.
            tokio::spawn(async move {
                let _ = conn.await;
            });

            let req = http::Request::builder()
                .method(method)
                .uri(format!("http://{endpoint}{path}"))
                .header("host", endpoint)
                .header("content-type", "application/json")
                .header(MAC_HEADER, self.sign(body))
                .body(http_body_util::Full::new(bytes::Bytes::copy_from_slice(
                    body,
                )))
                .map_err(|e| AgentError::Transport {
                    endpoint: endpoint.to_string(),
                    reason: e.to_string(),
                })?;

            let resp = sender
                .send_request(req)
                .await
                .map_err(|e| AgentError::Transport {
                    endpoint: endpoint.to_string(),
                    reason: e.to_string(),
                })?;

            let status = resp.status();
            let body = http_body_util::BodyExt::collect(resp.into_body())
                .await
                .map_err(|e| AgentError::BadResponse {
                    endpoint: endpoint.to_string(),
                    reason: e.to_string(),
                })?
                .to_bytes();

            if status == http::StatusCode::UNAUTHORIZED || status == http::StatusCode::FORBIDDEN {
                return Err(AgentError::AuthRejected(endpoint.to_string()));
            }
            if !status.is_success() {
                return Err(AgentError::AgentFault {
                    endpoint: endpoint.to_string(),
                    reason: format!("status {status}: {}", String::from_utf8_lossy(&body)),
                });
            }

            Ok(body.to_vec())
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::Timeout(endpoint.to_string())),
        }
    }
}

#[async_trait]
impl AgentChannel for HttpAgentClient {
    async fn provision(&self, endpoint: &str, config: &AgentConfig) -> Result<(), AgentError> {
        let body = serde_json::to_vec(config).map_err(|e| AgentError::BadResponse {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;
        self.request("PUT", endpoint, "/1.0/config", body).await?;
        debug!(%endpoint, amphora_id = %config.amphora_id, "configuration provisioned");
        Ok(())
    }

    async fn update(&self, endpoint: &str, config: &AgentConfig) -> Result<(), AgentError> {
        // The config push is a full-document PUT, so update and
        // provision share the same wire call.
        self.provision(endpoint, config).await
    }

    async fn get_status(&self, endpoint: &str) -> Result<AgentStatus, AgentError> {
        let body = self.request("GET", endpoint, "/1.0/status", Vec::new()).await?;
        serde_json::from_slice(&body).map_err(|e| AgentError::BadResponse {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })
    }

    async fn get_diagnostics(&self, endpoint: &str) -> Result<AgentDiagnostics, AgentError> {
        let body = self
            .request("GET", endpoint, "/1.0/diagnostics", Vec::new())
            .await?;
        serde_json::from_slice(&body).map_err(|e| AgentError::BadResponse {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })
    }
}
