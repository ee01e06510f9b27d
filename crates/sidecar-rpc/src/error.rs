use std::io;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

/// Framing-level protocol violations. All of them are fatal to the connection.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },

    #[error("zero-length frame")]
    Empty,

    #[error("undecodable frame: {0}")]
    Decode(String),

    #[error("stream I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Errors returned by [`crate::RpcClient::call`].
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("connection to {endpoint} not established within {timeout:?}")]
    ConnectTimeout { endpoint: String, timeout: Duration },

    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("request '{method}' timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("remote error {code}: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RpcError {
    /// Whether the error belongs to the connection rather than the remote application.
    ///
    /// Transport errors tear down the current connection; the next call reconnects.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            RpcError::ConnectTimeout { .. }
                | RpcError::Connect { .. }
                | RpcError::ConnectionClosed(_)
                | RpcError::Frame(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            RpcError::Timeout { .. } | RpcError::ConnectTimeout { .. }
        )
    }
}
