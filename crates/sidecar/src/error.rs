use std::path::PathBuf;
use std::time::Duration;

use sidecar_rpc::RpcError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Failures talking to a running worker through its transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("health request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("health endpoint returned {0}")]
    Status(reqwest::StatusCode),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0} is not available for this worker")]
    Unsupported(&'static str),
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn worker `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("circuit breaker open after {crashes} crashes; start explicitly to reset")]
    CircuitOpen { crashes: usize },

    #[error("failed to signal worker {pid}: {message}")]
    Signal { pid: u32, message: String },
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("config path has no parent directory: {0}")]
    NoParent(PathBuf),

    #[error(transparent)]
    Notify(#[from] notify::Error),
}
