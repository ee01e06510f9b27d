//! The command surface a UI drives: supervisor plus reload watcher, with
//! every outcome returned as a [`CommandResult`].

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::config::SidecarConfig;
use crate::error::TransportError;
use crate::events::{EventBus, SidecarEvent};
use crate::reload::{ReloadStatus, ReloadWatcher};
use crate::supervisor::{Supervisor, SupervisorOptions, SupervisorStatus};
use crate::transport::{Transport, build_transport};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl CommandResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
            base_url: None,
        }
    }

    pub fn failed(error: impl ToString) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            base_url: None,
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = Some(base_url);
        self
    }
}

impl<E: std::fmt::Display> From<Result<(), E>> for CommandResult {
    fn from(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Self::ok(),
            Err(err) => Self::failed(err),
        }
    }
}

/// One supervised worker and its config watcher.
pub struct SidecarService {
    config: SidecarConfig,
    events: EventBus,
    supervisor: Supervisor,
    watcher: ReloadWatcher,
}

impl SidecarService {
    pub fn new(config: SidecarConfig) -> Result<Self, TransportError> {
        let transport = build_transport(&config.transport, &config.rpc)?;
        Ok(Self::with_transport(config, transport, EventBus::new()))
    }

    pub fn with_transport(
        config: SidecarConfig,
        transport: Arc<dyn Transport>,
        events: EventBus,
    ) -> Self {
        let supervisor = Supervisor::new(
            SupervisorOptions::from_config(&config),
            transport,
            events.clone(),
        );
        let watcher = ReloadWatcher::new(
            config.reload.path.clone().unwrap_or_default(),
            config.reload.clone(),
            Arc::new(supervisor.clone()),
            events.clone(),
        );
        Self {
            config,
            events,
            supervisor,
            watcher,
        }
    }

    pub fn config(&self) -> &SidecarConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn watcher(&self) -> &ReloadWatcher {
        &self.watcher
    }

    pub async fn start(&self) -> CommandResult {
        match self.supervisor.start().await {
            Ok(()) => CommandResult::ok().with_base_url(self.base_url()),
            Err(err) => CommandResult::failed(err),
        }
    }

    pub async fn stop(&self) -> CommandResult {
        self.supervisor.stop().await.into()
    }

    pub async fn ensure_running(&self) -> CommandResult {
        match self.supervisor.ensure_running().await {
            Ok(()) => CommandResult::ok().with_base_url(self.base_url()),
            Err(err) => CommandResult::failed(err),
        }
    }

    pub async fn force_reload(&self) -> CommandResult {
        if self.watcher.force_reload().await {
            CommandResult::ok().with_base_url(self.base_url())
        } else if self.watcher.status().is_reloading {
            CommandResult::failed("reload already in progress")
        } else {
            CommandResult::failed("reload failed; see reload-failed event")
        }
    }

    /// Watch the configured reload path. Without one this does nothing.
    pub fn start_watching(&self) -> CommandResult {
        if self.config.reload.path.is_none() {
            return CommandResult::ok();
        }
        self.watcher.start_watching().into()
    }

    pub fn status(&self) -> SupervisorStatus {
        self.supervisor.status()
    }

    pub fn reload_status(&self) -> ReloadStatus {
        self.watcher.status()
    }

    pub fn base_url(&self) -> String {
        self.supervisor.base_url()
    }

    pub fn is_running(&self) -> bool {
        self.supervisor.is_running()
    }

    /// Forward a request to the worker under the default RPC timeout.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, TransportError> {
        self.call_with_timeout(method, params, self.config.rpc.client_config().default_timeout)
            .await
    }

    /// Like [`SidecarService::call`], for requests that move files or large
    /// payloads (`rpc.io_timeout_ms`).
    pub async fn call_io(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, TransportError> {
        self.call_with_timeout(method, params, self.config.rpc.io_timeout())
            .await
    }

    async fn call_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        let Some(client) = self.supervisor.transport().rpc() else {
            return Err(TransportError::Unsupported("rpc"));
        };
        Ok(client.call(method, params, Some(timeout)).await?)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SidecarEvent> {
        self.events.subscribe()
    }

    /// Stop watching and stop the worker.
    pub async fn shutdown(&self) -> CommandResult {
        self.watcher.shutdown();
        self.supervisor.stop().await.into()
    }
}
