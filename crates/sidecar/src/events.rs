//! Lifecycle notifications for whoever renders supervisor state.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default capacity of the event channel. Receivers further behind than this
/// observe `RecvError::Lagged` instead of holding up publishers.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Started,
    Stopped,
    Healthy,
    Unhealthy,
    Restarting,
    CircuitBreakerOpen,
    Error,
    ReloadStarted,
    ReloadCompleted,
    ReloadFailed,
    WatchError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidecarEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub message: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_mtime: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SidecarEvent {
    pub fn new(kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            timestamp: now_ms(),
            source_mtime: None,
            error: None,
        }
    }

    pub fn with_source_mtime(mut self, mtime: Option<u64>) -> Self {
        self.source_mtime = mtime;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Multi-consumer broadcast of [`SidecarEvent`]s.
///
/// Publishing never waits: with no subscribers the event is dropped, and a
/// slow subscriber loses the oldest events rather than blocking the sender.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SidecarEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: SidecarEvent) {
        tracing::debug!(kind = ?event.kind, message = %event.message, "Sidecar event");
        // Err only means nobody is listening.
        let _ = self.sender.send(event);
    }

    pub fn emit(&self, kind: EventKind, message: impl Into<String>) {
        self.publish(SidecarEvent::new(kind, message));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SidecarEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn now_ms() -> u64 {
    system_time_ms(SystemTime::now()).unwrap_or_default()
}

pub(crate) fn system_time_ms(time: SystemTime) -> Option<u64> {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .ok()
        .map(|elapsed| elapsed.as_millis() as u64)
}
