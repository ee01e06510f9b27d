//! TOML configuration for the supervisor.
//!
//! Every table and field has a default, so a file only needs `[worker]
//! program`. Durations are whole milliseconds (`*_ms`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SidecarConfig {
    pub worker: WorkerConfig,
    pub transport: TransportConfig,
    pub health: HealthConfig,
    pub restart: RestartConfig,
    pub shutdown: ShutdownConfig,
    pub rpc: RpcConfig,
    pub reload: ReloadConfig,
}

/// How much of the supervisor's own environment the worker sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EnvPolicy {
    /// Only variables named in `env_allow`, plus `env`.
    #[default]
    AllowList,
    /// Everything, plus `env`.
    Inherit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env_policy: EnvPolicy,
    pub env_allow: Vec<String>,
    /// Always set on the worker, regardless of policy.
    pub env: BTreeMap<String, String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: String::new(),
            args: Vec::new(),
            cwd: None,
            env_policy: EnvPolicy::AllowList,
            env_allow: crate::env::DEFAULT_ALLOW_LIST
                .iter()
                .map(|name| name.to_string())
                .collect(),
            env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    #[default]
    Http,
    Socket,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub kind: TransportKind,
    pub host: String,
    pub port: u16,
    pub health_path: String,
    pub shutdown_path: String,
    pub socket_path: PathBuf,
    /// Notification sent over the socket before signalling the worker.
    pub shutdown_method: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Http,
            host: "127.0.0.1".to_string(),
            port: 8765,
            health_path: "/health".to_string(),
            shutdown_path: "/shutdown".to_string(),
            socket_path: default_socket_path(),
            shutdown_method: None,
        }
    }
}

/// `$TMPDIR/sidecar-<uid>/server.sock`
pub fn default_socket_path() -> PathBuf {
    #[cfg(unix)]
    let owner = nix::unistd::getuid().to_string();
    #[cfg(not(unix))]
    let owner = "user".to_string();
    std::env::temp_dir()
        .join(format!("sidecar-{owner}"))
        .join("server.sock")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_ms: u64,
    pub timeout_ms: u64,
    /// Consecutive failed probes before the worker is treated as crashed.
    pub max_retries: u32,
    pub settle_delay_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            timeout_ms: 2_000,
            max_retries: 3,
            settle_delay_ms: 1_000,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    pub max_crashes: usize,
    pub crash_window_ms: u64,
    pub backoff_floor_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_crashes: 5,
            crash_window_ms: 300_000,
            backoff_floor_ms: 1_000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 60_000,
        }
    }
}

impl RestartConfig {
    pub fn crash_window(&self) -> Duration {
        Duration::from_millis(self.crash_window_ms)
    }

    pub fn backoff(&self) -> crate::backoff::Backoff {
        crate::backoff::Backoff::new(
            Duration::from_millis(self.backoff_floor_ms),
            Duration::from_millis(self.max_backoff_ms),
            self.backoff_multiplier,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Wait for a natural exit after the shutdown notification.
    pub grace_ms: u64,
    /// Wait after SIGTERM before SIGKILL.
    pub terminate_grace_ms: u64,
    pub notify_timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_ms: 2_000,
            terminate_grace_ms: 2_000,
            notify_timeout_ms: 2_000,
        }
    }
}

impl ShutdownConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_millis(self.notify_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub default_timeout_ms: u64,
    pub health_timeout_ms: u64,
    /// For calls that move files or large payloads.
    pub io_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            health_timeout_ms: 2_000,
            io_timeout_ms: 60_000,
            connect_timeout_ms: 5_000,
        }
    }
}

impl RpcConfig {
    pub fn client_config(&self) -> sidecar_rpc::RpcClientConfig {
        sidecar_rpc::RpcClientConfig {
            default_timeout: Duration::from_millis(self.default_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReloadConfig {
    /// File to watch. No watcher is started when unset.
    pub path: Option<PathBuf>,
    pub debounce_ms: u64,
    pub min_reload_interval_ms: u64,
    pub stability_threshold_ms: u64,
    pub poll_interval_ms: u64,
    pub restart_pause_ms: u64,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            path: None,
            debounce_ms: 500,
            min_reload_interval_ms: 2_000,
            stability_threshold_ms: 100,
            poll_interval_ms: 100,
            restart_pause_ms: 500,
        }
    }
}

impl ReloadConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn min_reload_interval(&self) -> Duration {
        Duration::from_millis(self.min_reload_interval_ms)
    }

    pub fn stability_threshold(&self) -> Duration {
        Duration::from_millis(self.stability_threshold_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn restart_pause(&self) -> Duration {
        Duration::from_millis(self.restart_pause_ms)
    }
}

impl SidecarConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: &str| Err(ConfigError::Invalid(message.to_string()));

        if self.worker.program.trim().is_empty() {
            return invalid("worker.program must not be empty");
        }
        if self.health.interval_ms == 0 {
            return invalid("health.interval_ms must be positive");
        }
        if self.health.timeout_ms == 0 {
            return invalid("health.timeout_ms must be positive");
        }
        if self.health.max_retries == 0 {
            return invalid("health.max_retries must be positive");
        }
        if self.restart.max_crashes == 0 {
            return invalid("restart.max_crashes must be positive");
        }
        if self.restart.crash_window_ms == 0 {
            return invalid("restart.crash_window_ms must be positive");
        }
        let multiplier = self.restart.backoff_multiplier;
        if multiplier.is_nan() || multiplier < 1.0 {
            return invalid("restart.backoff_multiplier must be at least 1.0");
        }
        if self.restart.backoff_floor_ms > self.restart.max_backoff_ms {
            return invalid("restart.backoff_floor_ms exceeds restart.max_backoff_ms");
        }
        if self.rpc.default_timeout_ms == 0
            || self.rpc.health_timeout_ms == 0
            || self.rpc.connect_timeout_ms == 0
        {
            return invalid("rpc timeouts must be positive");
        }
        if self.reload.poll_interval_ms == 0 {
            return invalid("reload.poll_interval_ms must be positive");
        }
        if self.transport.kind == TransportKind::Http && !self.transport.health_path.starts_with('/')
        {
            return invalid("transport.health_path must start with '/'");
        }
        Ok(())
    }
}

/// Read, parse and validate a config file.
pub fn load_config(path: impl AsRef<Path>) -> Result<SidecarConfig, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config = parse_config(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    config.validate()?;
    tracing::debug!(path = %path.display(), "Loaded sidecar config");
    Ok(config)
}

pub fn parse_config(raw: &str) -> Result<SidecarConfig, toml::de::Error> {
    toml::from_str(raw)
}
