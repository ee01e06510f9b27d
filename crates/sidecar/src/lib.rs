//! Supervision of an external worker process.
//!
//! A [`Supervisor`] spawns the worker, polls its health through a
//! [`Transport`] (plain HTTP probe or framed JSON-RPC over a Unix socket),
//! restarts it with backoff after crashes and stops retrying once the crash
//! circuit breaker opens. A [`ReloadWatcher`] restarts the worker when its
//! configuration file changes. Everything observable is published on an
//! [`EventBus`].
//!
//! [`SidecarService`] bundles the pieces behind the command surface a UI
//! consumes (start, stop, ensure-running, force-reload, status queries).

pub mod backoff;
pub mod config;
pub mod env;
pub mod error;
pub mod events;
pub mod health;
pub mod logging;
pub mod process;
pub mod reload;
pub mod service;
pub mod supervisor;
pub mod transport;

pub use backoff::Backoff;
pub use config::{SidecarConfig, load_config};
pub use error::{ConfigError, SupervisorError, TransportError, WatchError};
pub use events::{EventBus, EventKind, SidecarEvent};
pub use health::{CrashVerdict, HealthState};
pub use reload::{ReloadStatus, ReloadTarget, ReloadWatcher};
pub use service::{CommandResult, SidecarService};
pub use supervisor::{SupervisorPhase, SupervisorStatus, Supervisor};
#[cfg(unix)]
pub use transport::SocketTransport;
pub use transport::{HttpTransport, Transport};
