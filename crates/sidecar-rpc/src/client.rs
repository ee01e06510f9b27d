//! JSON-RPC client over a lazily established framed connection.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::connector::{BoxedReader, BoxedWriter, Connector};
use crate::error::{FrameError, RpcError};
use crate::framing::{FramedWriter, MAX_FRAME_LEN, read_frames};
use crate::request_table::RequestTable;
use crate::types::{RequestId, RpcRequest, RpcResponse};

#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    /// Used when a call does not pass its own timeout.
    pub default_timeout: Duration,
    /// Upper bound on establishing the connection.
    pub connect_timeout: Duration,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

struct Connection {
    writer: FramedWriter<BoxedWriter>,
    reader_task: JoinHandle<()>,
    epoch: u64,
}

impl Connection {
    async fn close(mut self) {
        self.reader_task.abort();
        let _ = self.writer.shutdown().await;
    }
}

struct ClientInner {
    connector: Arc<dyn Connector>,
    config: RpcClientConfig,
    pending: RequestTable,
    request_counter: AtomicI64,
    epoch_counter: AtomicU64,
    connection: Mutex<Option<Connection>>,
}

/// Request/response client. Cheap to clone; clones share one connection.
///
/// Responses are correlated by id, so concurrent calls may complete in any
/// order. A transport failure rejects every outstanding call and the next
/// call reconnects.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl RpcClient {
    pub fn new(connector: Arc<dyn Connector>, config: RpcClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                connector,
                config,
                pending: RequestTable::new(),
                request_counter: AtomicI64::new(1),
                epoch_counter: AtomicU64::new(0),
                connection: Mutex::new(None),
            }),
        }
    }

    pub fn endpoint(&self) -> String {
        self.inner.connector.endpoint()
    }

    pub fn config(&self) -> &RpcClientConfig {
        &self.inner.config
    }

    /// Issue `method` and wait for its result.
    ///
    /// `timeout` defaults to [`RpcClientConfig::default_timeout`]. After a
    /// timeout the request is forgotten; a reply that shows up later is dropped.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, RpcError> {
        let timeout = timeout.unwrap_or(self.inner.config.default_timeout);
        let id = RequestId::Integer(self.inner.request_counter.fetch_add(1, Ordering::SeqCst));
        let payload = serde_json::to_vec(&RpcRequest::new(id.clone(), method, params))?;
        if payload.len() > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge {
                len: payload.len(),
                max: MAX_FRAME_LEN,
            }
            .into());
        }

        let receiver = {
            let mut slot = self.inner.connection.lock().await;
            let connection = match slot.take() {
                Some(connection) => connection,
                // A short call must not wait out the full connect window.
                None => {
                    let bound = timeout.min(self.inner.config.connect_timeout);
                    ClientInner::connect(&self.inner, bound).await?
                }
            };
            let connection = slot.insert(connection);

            // Registered under the connection lock so a concurrent teardown of
            // an older connection cannot reject it.
            let receiver = self.inner.pending.register(id.clone());
            let deadline = Instant::now() + timeout;
            let sent = tokio::time::timeout_at(deadline, connection.writer.send(&payload)).await;
            let failure = match sent {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(RpcError::Frame(err)),
                Err(_elapsed) => Some(RpcError::Timeout {
                    method: method.to_string(),
                    timeout,
                }),
            };
            if let Some(err) = failure {
                // A partially written frame leaves the stream unusable.
                self.inner.pending.remove(&id);
                let reason = format!("write failed: {err}");
                if let Some(connection) = slot.take() {
                    connection.close().await;
                }
                let rejected = self.inner.pending.reject_all(&reason);
                tracing::warn!(
                    endpoint = %self.inner.connector.endpoint(),
                    method,
                    rejected,
                    "RPC write failed; connection reset"
                );
                return Err(err);
            }
            receiver
        };

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_canceled)) => Err(RpcError::ConnectionClosed(
                "request dropped before completion".to_string(),
            )),
            Err(_elapsed) => {
                self.inner.pending.remove(&id);
                tracing::debug!(%id, method, ?timeout, "RPC request timed out");
                Err(RpcError::Timeout {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Typed wrapper around [`RpcClient::call`].
    pub async fn request<P, R>(
        &self,
        method: &str,
        params: Option<&P>,
        timeout: Option<Duration>,
    ) -> Result<R, RpcError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let params = params.map(serde_json::to_value).transpose()?;
        let result = self.call(method, params, timeout).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Send a notification (no id, no response expected).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), RpcError> {
        let payload = serde_json::to_vec(&RpcRequest::notification(method, params))?;
        let mut slot = self.inner.connection.lock().await;
        let connection = match slot.take() {
            Some(connection) => connection,
            None => ClientInner::connect(&self.inner, self.inner.config.connect_timeout).await?,
        };
        let connection = slot.insert(connection);
        if let Err(err) = connection.writer.send(&payload).await {
            if let Some(connection) = slot.take() {
                connection.close().await;
            }
            self.inner
                .pending
                .reject_all(&format!("write failed: {err}"));
            return Err(err.into());
        }
        Ok(())
    }

    /// Drop the connection and reject everything still pending.
    ///
    /// Returns the number of rejected requests. Safe to call when not connected.
    pub async fn disconnect(&self, reason: &str) -> usize {
        let mut slot = self.inner.connection.lock().await;
        if let Some(connection) = slot.take() {
            connection.close().await;
        }
        let rejected = self.inner.pending.reject_all(reason);
        if rejected > 0 {
            tracing::debug!(rejected, reason, "Rejected pending RPC requests");
        }
        rejected
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.connection.lock().await.is_some()
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }
}

impl ClientInner {
    async fn connect(this: &Arc<Self>, timeout: Duration) -> Result<Connection, RpcError> {
        let endpoint = this.connector.endpoint();
        // Dropping the connect future on timeout tears down the half-open socket.
        let (reader, writer) = match tokio::time::timeout(timeout, this.connector.connect()).await
        {
            Ok(Ok(io)) => io,
            Ok(Err(source)) => return Err(RpcError::Connect { endpoint, source }),
            Err(_elapsed) => return Err(RpcError::ConnectTimeout { endpoint, timeout }),
        };

        let epoch = this.epoch_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let reader_task = tokio::spawn(read_loop(Arc::downgrade(this), reader, epoch));
        tracing::debug!(%endpoint, epoch, "RPC connection established");

        Ok(Connection {
            writer: FramedWriter::new(writer),
            reader_task,
            epoch,
        })
    }

    fn dispatch(&self, frame: &[u8]) -> Result<(), FrameError> {
        let value: Value =
            serde_json::from_slice(frame).map_err(|err| FrameError::Decode(err.to_string()))?;

        if let Some(method) = value.get("method").and_then(Value::as_str) {
            tracing::debug!(method, "Ignoring worker-initiated message");
            return Ok(());
        }

        let response: RpcResponse =
            serde_json::from_value(value).map_err(|err| FrameError::Decode(err.to_string()))?;
        let Some(id) = response.id else {
            if let Some(error) = response.error {
                tracing::warn!(code = error.code, message = %error.message, "RPC error without id");
            }
            return Ok(());
        };

        let result = match response.error {
            Some(error) => Err(RpcError::Remote {
                code: error.code,
                message: error.message,
                data: error.data,
            }),
            None => Ok(response.result.unwrap_or(Value::Null)),
        };

        if !self.pending.complete(&id, result) {
            tracing::warn!(%id, "RPC response without pending request");
        }
        Ok(())
    }

    async fn connection_lost(&self, epoch: u64, reason: &str) {
        let mut slot = self.connection.lock().await;
        if slot.as_ref().is_some_and(|connection| connection.epoch == epoch) {
            // This runs on the reader task itself, so the handle is dropped, not aborted.
            slot.take();
            let rejected = self.pending.reject_all(reason);
            tracing::debug!(epoch, rejected, reason, "RPC connection lost");
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.get_mut().take() {
            connection.reader_task.abort();
        }
    }
}

async fn read_loop(inner: Weak<ClientInner>, reader: BoxedReader, epoch: u64) {
    let target = inner.clone();
    let outcome = read_frames(reader, |frame| match target.upgrade() {
        Some(inner) => inner.dispatch(&frame),
        None => Err(FrameError::Decode("client dropped".to_string())),
    })
    .await;

    let reason = match outcome {
        Ok(()) => "connection closed by peer".to_string(),
        Err(err) => {
            tracing::warn!(error = %err, "RPC connection failed");
            err.to_string()
        }
    };

    if let Some(inner) = inner.upgrade() {
        inner.connection_lost(epoch, &reason).await;
    }
}
