//! Worker-side method dispatch over the same framed protocol.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

use crate::error::FrameError;
use crate::framing::{FrameDecoder, FramedWriter};
use crate::types::{ErrorObject, JSONRPC_VERSION, RequestId, RpcResponse, error_codes};

pub type MethodResult = Result<Value, ErrorObject>;

type Handler = Arc<dyn Fn(Option<Value>) -> BoxFuture<'static, MethodResult> + Send + Sync>;

/// Registry of named async methods.
#[derive(Clone, Default)]
pub struct Dispatcher {
    methods: HashMap<String, Handler>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, method: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResult> + Send + 'static,
    {
        let method = method.into();
        tracing::debug!(%method, "Registered RPC method");
        let handler: Handler = Arc::new(move |params| handler(params).boxed());
        self.methods.insert(method, handler);
        self
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    /// Turn one request frame (single or batch) into its response frame.
    ///
    /// Returns `None` when nothing should be written back (notifications).
    pub async fn handle(&self, frame: &[u8]) -> Option<Vec<u8>> {
        let request: Value = match serde_json::from_slice(frame) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(error = %err, "RPC parse error");
                let error = ErrorObject::new(error_codes::PARSE_ERROR, format!("Parse error: {err}"));
                return encode(&RpcResponse::failure(None, error));
            }
        };

        match request {
            Value::Array(batch) => {
                let mut responses = Vec::with_capacity(batch.len());
                for item in batch {
                    if let Some(response) = self.handle_single(item).await {
                        responses.push(response);
                    }
                }
                if responses.is_empty() {
                    None
                } else {
                    encode(&responses)
                }
            }
            single => self
                .handle_single(single)
                .await
                .and_then(|response| encode(&response)),
        }
    }

    async fn handle_single(&self, request: Value) -> Option<RpcResponse> {
        let Value::Object(request) = request else {
            return Some(invalid_request(None, "Request must be object"));
        };

        let id: Option<RequestId> = request
            .get("id")
            .and_then(|id| serde_json::from_value(id.clone()).ok());

        if request.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Some(invalid_request(id, "Invalid or missing jsonrpc version"));
        }
        let Some(method) = request.get("method").and_then(Value::as_str) else {
            return Some(invalid_request(id, "Method must be string"));
        };
        let Some(handler) = self.methods.get(method) else {
            return Some(RpcResponse::failure(id, ErrorObject::method_not_found(method)));
        };

        let outcome = handler(request.get("params").cloned()).await;
        if let Err(error) = &outcome {
            tracing::debug!(method, code = error.code, message = %error.message, "RPC method failed");
        }

        // Notifications get no response.
        let id = id?;
        Some(match outcome {
            Ok(result) => RpcResponse::success(Some(id), result),
            Err(error) => RpcResponse::failure(Some(id), error),
        })
    }
}

fn invalid_request(id: Option<RequestId>, message: &str) -> RpcResponse {
    RpcResponse::failure(id, ErrorObject::new(error_codes::INVALID_REQUEST, message))
}

fn encode<T: Serialize>(value: &T) -> Option<Vec<u8>> {
    match serde_json::to_vec(value) {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            tracing::error!(error = %err, "RPC response encode failed");
            None
        }
    }
}

/// Serve one connection: requests are handled one at a time in arrival order.
///
/// Returns on EOF or on the first protocol violation; the caller drops the
/// stream, which closes the connection.
pub async fn serve_connection<R, W>(
    mut reader: R,
    writer: W,
    dispatcher: Arc<Dispatcher>,
) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut decoder = FrameDecoder::new();
    let mut writer = FramedWriter::new(writer);
    let mut chunk = vec![0u8; 8 * 1024];
    loop {
        let read = reader.read(&mut chunk).await?;
        if read == 0 {
            return Ok(());
        }
        decoder.push(&chunk[..read]);
        while let Some(frame) = decoder.next_frame()? {
            if let Some(response) = dispatcher.handle(&frame).await {
                writer.send(&response).await?;
            }
        }
    }
}

/// Accept connections until the listener fails or the task is aborted.
#[cfg(unix)]
pub async fn serve_unix(
    listener: tokio::net::UnixListener,
    dispatcher: Arc<Dispatcher>,
) -> std::io::Result<()> {
    loop {
        let (stream, _addr) = listener.accept().await?;
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            let (reader, writer) = stream.into_split();
            if let Err(err) = serve_connection(reader, writer, dispatcher).await {
                tracing::warn!(error = %err, "RPC client connection closed with error");
            }
        });
    }
}
