//! How the supervisor talks to a running worker.
//!
//! Both bindings answer the same questions (is it alive, please shut down,
//! drop anything in flight), so the supervisor is written once against
//! [`Transport`].

#[cfg(unix)]
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use sidecar_rpc::RpcClient;
#[cfg(unix)]
use sidecar_rpc::{RpcClientConfig, RpcError, UnixSocketConnector};

use crate::config::{RpcConfig, TransportConfig, TransportKind};
use crate::error::TransportError;

/// Method the socket worker answers for liveness.
pub const PING_METHOD: &str = "ping";

#[async_trait]
pub trait Transport: Send + Sync {
    /// Short label for logs.
    fn kind(&self) -> &'static str;

    /// Address UI collaborators use to reach the worker.
    fn base_url(&self) -> String;

    /// One bounded liveness check.
    async fn probe(&self, timeout: Duration) -> Result<(), TransportError>;

    /// Best-effort request for the worker to exit on its own.
    async fn notify_shutdown(&self, _timeout: Duration) -> Result<(), TransportError> {
        Ok(())
    }

    /// Drop the connection and fail every request still waiting on it.
    /// Returns how many requests were rejected.
    async fn close(&self, _reason: &str) -> usize {
        0
    }

    /// Request/response channel to the worker, when the binding has one.
    fn rpc(&self) -> Option<&RpcClient> {
        None
    }
}

/// Worker exposing `GET /health` and optionally `POST /shutdown`.
pub struct HttpTransport {
    client: Client,
    base_url: String,
    health_path: String,
    shutdown_path: String,
}

impl HttpTransport {
    pub fn new(
        base_url: impl Into<String>,
        health_path: impl Into<String>,
        shutdown_path: impl Into<String>,
    ) -> Result<Self, TransportError> {
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            health_path: health_path.into(),
            shutdown_path: shutdown_path.into(),
        })
    }

    pub fn from_config(config: &TransportConfig) -> Result<Self, TransportError> {
        Self::new(
            format!("http://{}:{}", config.host, config.port),
            &config.health_path,
            &config.shutdown_path,
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> &'static str {
        "http"
    }

    fn base_url(&self) -> String {
        self.base_url.clone()
    }

    async fn probe(&self, timeout: Duration) -> Result<(), TransportError> {
        let response = self
            .client
            .get(self.url(&self.health_path))
            .timeout(timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TransportError::Status(response.status()));
        }
        Ok(())
    }

    async fn notify_shutdown(&self, timeout: Duration) -> Result<(), TransportError> {
        self.client
            .post(self.url(&self.shutdown_path))
            .timeout(timeout)
            .send()
            .await?;
        Ok(())
    }
}

/// Worker speaking framed JSON-RPC on a Unix socket.
#[cfg(unix)]
pub struct SocketTransport {
    client: RpcClient,
    socket_path: PathBuf,
    shutdown_method: Option<String>,
}

#[cfg(unix)]
impl SocketTransport {
    pub fn new(
        socket_path: impl Into<PathBuf>,
        config: RpcClientConfig,
        shutdown_method: Option<String>,
    ) -> Self {
        let socket_path = socket_path.into();
        let connector = Arc::new(UnixSocketConnector::new(&socket_path));
        Self {
            client: RpcClient::new(connector, config),
            socket_path,
            shutdown_method,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn client(&self) -> &RpcClient {
        &self.client
    }

    pub async fn call(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, RpcError> {
        self.client.call(method, params, timeout).await
    }
}

#[cfg(unix)]
#[async_trait]
impl Transport for SocketTransport {
    fn kind(&self) -> &'static str {
        "socket"
    }

    fn base_url(&self) -> String {
        format!("unix://{}", self.socket_path.display())
    }

    async fn probe(&self, timeout: Duration) -> Result<(), TransportError> {
        self.client.call(PING_METHOD, None, Some(timeout)).await?;
        Ok(())
    }

    async fn notify_shutdown(&self, timeout: Duration) -> Result<(), TransportError> {
        let Some(method) = &self.shutdown_method else {
            return Ok(());
        };
        tokio::time::timeout(timeout, self.client.notify(method, None))
            .await
            .map_err(|_elapsed| TransportError::Timeout(timeout))??;
        Ok(())
    }

    async fn close(&self, reason: &str) -> usize {
        self.client.disconnect(reason).await
    }

    fn rpc(&self) -> Option<&RpcClient> {
        Some(&self.client)
    }
}

/// Build the binding named by `[transport] kind`.
pub fn build_transport(
    transport: &TransportConfig,
    rpc: &RpcConfig,
) -> Result<Arc<dyn Transport>, TransportError> {
    let built: Arc<dyn Transport> = match transport.kind {
        TransportKind::Http => Arc::new(HttpTransport::from_config(transport)?),
        #[cfg(unix)]
        TransportKind::Socket => Arc::new(SocketTransport::new(
            &transport.socket_path,
            rpc.client_config(),
            transport.shutdown_method.clone(),
        )),
        #[cfg(not(unix))]
        TransportKind::Socket => {
            let _ = rpc;
            return Err(TransportError::Unsupported("socket"));
        }
    };
    Ok(built)
}
