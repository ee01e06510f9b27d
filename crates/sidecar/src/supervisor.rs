//! Lifecycle of the supervised worker.
//!
//! One [`Supervisor`] owns at most one [`WorkerProcess`] and the
//! [`Transport`] used to reach it. Unexpected exits and exhausted health
//! checks both count as crashes; crashes inside the window schedule a
//! restart with backoff until the circuit breaker opens, after which only an
//! explicit [`Supervisor::start`] brings the worker back.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::backoff::Backoff;
use crate::config::{HealthConfig, RestartConfig, ShutdownConfig, SidecarConfig, TransportKind};
use crate::error::{SupervisorError, TransportError};
use crate::events::{EventBus, EventKind, now_ms};
use crate::health::{CrashPolicy, CrashVerdict, HealthMonitor, HealthState, HealthTarget};
use crate::process::{WorkerExit, WorkerProcess, WorkerSpec};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SupervisorPhase {
    Stopped,
    Starting,
    Running,
    Healthy,
    Unhealthy,
    Stopping,
    CircuitOpen,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorStatus {
    pub running: bool,
    pub failure_count: u32,
    pub recent_crashes: usize,
    pub circuit_breaker_open: bool,
    pub phase: SupervisorPhase,
    pub pid: Option<u32>,
    /// Automatic restarts since the last explicit start.
    pub restart_count: u32,
    pub last_healthy_at: Option<u64>,
    pub health_polling: bool,
}

/// Everything the supervisor needs besides its transport and bus.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub worker: WorkerSpec,
    pub health: HealthConfig,
    pub restart: RestartConfig,
    pub shutdown: ShutdownConfig,
    /// Bound on a single liveness probe.
    pub probe_timeout: Duration,
}

impl SupervisorOptions {
    pub fn from_config(config: &SidecarConfig) -> Self {
        let probe_timeout = match config.transport.kind {
            TransportKind::Socket => config.rpc.health_timeout(),
            TransportKind::Http => config.health.timeout(),
        };
        Self {
            worker: WorkerSpec::from_config(&config.worker),
            health: config.health.clone(),
            restart: config.restart.clone(),
            shutdown: config.shutdown.clone(),
            probe_timeout,
        }
    }
}

struct State {
    phase: SupervisorPhase,
    worker: Option<Arc<WorkerProcess>>,
    /// Bumped whenever a worker is spawned or detached; exit reports from
    /// older generations are ignored.
    generation: u64,
    /// Bumped by every explicit start or stop. A crash verdict reached under
    /// an older value is dropped, so a request made mid-teardown wins.
    command_epoch: u64,
    shutting_down: bool,
    health: HealthState,
    backoff: Backoff,
    restart_count: u32,
    health_task: Option<JoinHandle<()>>,
    restart_task: Option<JoinHandle<()>>,
    exit_task: Option<JoinHandle<()>>,
}

impl State {
    fn worker_alive(&self) -> bool {
        self.worker.as_ref().is_some_and(|worker| worker.is_alive())
    }

    fn stop_health_polling(&mut self) {
        if let Some(task) = self.health_task.take() {
            task.abort();
        }
    }

    fn cancel_restart(&mut self) {
        if let Some(task) = self.restart_task.take() {
            task.abort();
        }
    }

    /// Take the worker out of supervision so its exit is not treated as a crash.
    fn detach_worker(&mut self) -> Option<Arc<WorkerProcess>> {
        self.stop_health_polling();
        if let Some(task) = self.exit_task.take() {
            task.abort();
        }
        let worker = self.worker.take()?;
        self.generation += 1;
        Some(worker)
    }
}

struct Inner {
    options: SupervisorOptions,
    transport: Arc<dyn Transport>,
    events: EventBus,
    state: Mutex<State>,
}

/// Cheap to clone; clones drive the same worker.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(options: SupervisorOptions, transport: Arc<dyn Transport>, events: EventBus) -> Self {
        let backoff = options.restart.backoff();
        Self {
            inner: Arc::new(Inner {
                options,
                transport,
                events,
                state: Mutex::new(State {
                    phase: SupervisorPhase::Stopped,
                    worker: None,
                    generation: 0,
                    command_epoch: 0,
                    shutting_down: false,
                    health: HealthState::new(),
                    backoff,
                    restart_count: 0,
                    health_task: None,
                    restart_task: None,
                    exit_task: None,
                }),
            }),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub fn base_url(&self) -> String {
        self.inner.transport.base_url()
    }

    /// Fresh start: clears crash history and backoff, closing the circuit.
    /// A no-op while a worker is already running.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        {
            let mut state = self.inner.state.lock();
            if state.worker_alive() {
                tracing::debug!("Worker already running");
                return Ok(());
            }
            state.command_epoch += 1;
            state.cancel_restart();
            state.shutting_down = false;
            state.health.clear_crashes();
            state.backoff.reset();
            state.restart_count = 0;
        }
        Inner::spawn_worker(&self.inner).map(|_| ())
    }

    /// Start unless a worker is already running. Refuses while the circuit
    /// breaker is open; only [`Supervisor::start`] resets it.
    pub async fn ensure_running(&self) -> Result<(), SupervisorError> {
        {
            let state = self.inner.state.lock();
            if state.worker_alive() {
                return Ok(());
            }
            if state.phase == SupervisorPhase::CircuitOpen {
                return Err(SupervisorError::CircuitOpen {
                    crashes: state.health.recent_crashes(),
                });
            }
        }
        self.start().await
    }

    /// Stop the worker: shutdown notification, grace period, SIGTERM, SIGKILL.
    ///
    /// Pending requests on the transport are always rejected before this
    /// returns, even when signalling fails. Without a worker this sends no
    /// signals, but still cancels any restart a crash in progress would schedule.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let worker = {
            let mut state = self.inner.state.lock();
            state.command_epoch += 1;
            state.cancel_restart();
            let Some(worker) = state.detach_worker() else {
                tracing::debug!("Stop requested with no worker running");
                if state.phase != SupervisorPhase::CircuitOpen {
                    state.phase = SupervisorPhase::Stopped;
                }
                return Ok(());
            };
            state.shutting_down = true;
            state.phase = SupervisorPhase::Stopping;
            worker
        };

        let result = self.inner.shutdown_worker(&worker).await;

        {
            let mut state = self.inner.state.lock();
            state.shutting_down = false;
            if state.phase == SupervisorPhase::Stopping {
                state.phase = SupervisorPhase::Stopped;
            }
        }
        let message = match worker.exit() {
            Some(exit) => format!("Worker stopped ({exit})"),
            None => "Worker stopped".to_string(),
        };
        self.inner.events.emit(EventKind::Stopped, message);
        result
    }

    /// Treat the worker as crashed after exhausting its health checks.
    ///
    /// Ignored while shutting down or with the circuit already open.
    pub async fn handle_health_check_failure(&self) {
        Inner::handle_health_check_failure(&self.inner).await;
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().worker_alive()
    }

    pub fn worker_pid(&self) -> Option<u32> {
        let state = self.inner.state.lock();
        state.worker.as_ref().and_then(|worker| worker.pid())
    }

    pub fn phase(&self) -> SupervisorPhase {
        self.inner.state.lock().phase
    }

    pub fn status(&self) -> SupervisorStatus {
        let mut state = self.inner.state.lock();
        let window = self.inner.options.restart.crash_window();
        state.health.prune(Instant::now(), window);

        let max_crashes = self.inner.options.restart.max_crashes;
        SupervisorStatus {
            running: state.worker_alive(),
            failure_count: state.health.failure_count,
            recent_crashes: state.health.recent_crashes(),
            circuit_breaker_open: state.phase == SupervisorPhase::CircuitOpen
                || state.health.circuit_open(max_crashes),
            phase: state.phase,
            pid: state.worker.as_ref().and_then(|worker| worker.pid()),
            restart_count: state.restart_count,
            last_healthy_at: state.health.last_healthy_at,
            health_polling: state
                .health_task
                .as_ref()
                .is_some_and(|task| !task.is_finished()),
        }
    }

    #[cfg(test)]
    pub(crate) fn set_shutting_down(&self, shutting_down: bool) {
        self.inner.state.lock().shutting_down = shutting_down;
    }
}

impl Inner {
    fn crash_policy(&self) -> CrashPolicy {
        CrashPolicy {
            max_crashes: self.options.restart.max_crashes,
            window: self.options.restart.crash_window(),
        }
    }

    fn health_monitor(&self) -> HealthMonitor {
        HealthMonitor {
            interval: self.options.health.interval(),
            settle_delay: self.options.health.settle_delay(),
            max_retries: self.options.health.max_retries,
        }
    }

    /// Spawn a worker unless one is alive. Crash history is left alone.
    fn spawn_worker(this: &Arc<Self>) -> Result<Option<u32>, SupervisorError> {
        let pid = {
            let mut state = this.state.lock();
            if state.worker_alive() {
                return Ok(state.worker.as_ref().and_then(|worker| worker.pid()));
            }
            state.phase = SupervisorPhase::Starting;

            let worker = match WorkerProcess::spawn(&this.options.worker) {
                Ok(worker) => Arc::new(worker),
                Err(err) => {
                    state.phase = SupervisorPhase::Stopped;
                    drop(state);
                    tracing::error!(error = %err, "Failed to start worker");
                    this.events.emit(EventKind::Error, err.to_string());
                    return Err(err);
                }
            };

            state.generation += 1;
            let generation = state.generation;
            let pid = worker.pid();
            state.exit_task = Some(tokio::spawn(watch_exit(
                Arc::downgrade(this),
                generation,
                worker.exit_watch(),
            )));
            state.worker = Some(worker);
            state.phase = SupervisorPhase::Running;
            state.health.reset_failures();
            state.backoff.reset();
            state.stop_health_polling();
            state.health_task = Some(this.health_monitor().spawn(Arc::downgrade(this)));
            pid
        };

        let message = match pid {
            Some(pid) => format!("Worker started (pid {pid})"),
            None => "Worker started".to_string(),
        };
        this.events.emit(EventKind::Started, message);
        Ok(pid)
    }

    async fn on_worker_exit(this: &Arc<Self>, generation: u64, exit: Option<WorkerExit>) {
        let (verdict, epoch) = {
            let mut state = this.state.lock();
            if state.generation != generation || state.shutting_down {
                return;
            }
            // This runs on the exit task, so its handle is dropped rather than aborted.
            state.exit_task.take();
            state.stop_health_polling();
            state.worker = None;
            state.generation += 1;
            state.phase = SupervisorPhase::Stopped;
            (this.record_crash(&mut state), state.command_epoch)
        };

        let description = exit.map_or_else(|| "unknown status".to_string(), |exit| exit.to_string());
        tracing::warn!(exit = %description, "Worker exited unexpectedly");
        this.events.emit(
            EventKind::Error,
            format!("Worker exited unexpectedly ({description})"),
        );
        let rejected = this.transport.close("worker exited").await;
        if rejected > 0 {
            tracing::debug!(rejected, "Rejected requests to exited worker");
        }
        Inner::apply_verdict(this, verdict, epoch);
    }

    async fn handle_health_check_failure(this: &Arc<Self>) {
        let (verdict, epoch, worker) = {
            let mut state = this.state.lock();
            state.health.reset_failures();
            if state.shutting_down {
                tracing::debug!("Ignoring health check failure during shutdown");
                return;
            }
            if state.phase == SupervisorPhase::CircuitOpen {
                return;
            }
            let worker = state.detach_worker();
            state.phase = SupervisorPhase::Unhealthy;
            (this.record_crash(&mut state), state.command_epoch, worker)
        };

        tracing::warn!("Worker failed its health checks; treating as crashed");
        // The unresponsive process has to go before a replacement starts.
        if let Some(worker) = worker {
            if let Err(err) = this.shutdown_worker(&worker).await {
                tracing::warn!(error = %err, "Failed to stop unresponsive worker");
            }
        }
        Inner::apply_verdict(this, verdict, epoch);
    }

    fn record_crash(&self, state: &mut State) -> CrashVerdict {
        let policy = self.crash_policy();
        let State {
            health, backoff, ..
        } = state;
        health.register_crash(Instant::now(), policy, backoff)
    }

    /// Act on a crash verdict unless an explicit start or stop happened after
    /// the crash was recorded (`epoch` no longer current).
    fn apply_verdict(this: &Arc<Self>, verdict: CrashVerdict, epoch: u64) {
        match verdict {
            CrashVerdict::Restart { delay } => {
                let mut state = this.state.lock();
                if state.shutting_down || state.command_epoch != epoch {
                    tracing::debug!("Crash superseded by an explicit start or stop; not restarting");
                    return;
                }
                let attempt = state.restart_count + 1;
                let weak = Arc::downgrade(this);
                state.cancel_restart();
                state.restart_task = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(inner) = weak.upgrade() {
                        Inner::restart(&inner);
                    }
                }));
                drop(state);

                tracing::info!(?delay, attempt, "Scheduling worker restart");
                this.events.emit(
                    EventKind::Restarting,
                    format!("Restarting worker in {}ms (attempt {attempt})", delay.as_millis()),
                );
            }
            CrashVerdict::OpenCircuit { crashes } => {
                let worker = {
                    let mut state = this.state.lock();
                    if state.command_epoch != epoch {
                        tracing::debug!(crashes, "Crash superseded by an explicit start or stop");
                        return;
                    }
                    state.cancel_restart();
                    state.phase = SupervisorPhase::CircuitOpen;
                    state.detach_worker()
                };
                tracing::error!(crashes, "Circuit breaker open; automatic restarts disabled");
                this.events.emit(
                    EventKind::CircuitBreakerOpen,
                    format!("Worker crashed {crashes} times; not restarting until started explicitly"),
                );
                if let Some(worker) = worker {
                    let inner = this.clone();
                    tokio::spawn(async move {
                        if let Err(err) = inner.shutdown_worker(&worker).await {
                            tracing::warn!(error = %err, "Failed to stop worker after circuit opened");
                        }
                    });
                }
            }
        }
    }

    /// Automatic restart; keeps crash history.
    fn restart(this: &Arc<Self>) {
        {
            let mut state = this.state.lock();
            // Running on the restart task itself.
            state.restart_task.take();
            if state.shutting_down || state.phase == SupervisorPhase::CircuitOpen {
                return;
            }
            state.restart_count += 1;
        }

        if let Err(err) = Inner::spawn_worker(this) {
            tracing::warn!(error = %err, "Restart failed");
            let (verdict, epoch) = {
                let mut state = this.state.lock();
                (this.record_crash(&mut state), state.command_epoch)
            };
            Inner::apply_verdict(this, verdict, epoch);
        }
    }

    /// Escalating shutdown of a detached worker. Always closes the transport.
    async fn shutdown_worker(&self, worker: &WorkerProcess) -> Result<(), SupervisorError> {
        let pid = worker.pid();
        let shutdown = &self.options.shutdown;
        let mut result = Ok(());

        if worker.is_alive() {
            if let Err(err) = self
                .transport
                .notify_shutdown(shutdown.notify_timeout())
                .await
            {
                tracing::debug!(?pid, error = %err, "Shutdown notification not delivered");
            }

            if worker.wait_for_exit(shutdown.grace()).await.is_none() {
                tracing::info!(?pid, "Worker still running after grace period; sending SIGTERM");
                if let Err(err) = worker.terminate() {
                    tracing::warn!(?pid, error = %err, "SIGTERM failed");
                    result = Err(err);
                }
                if worker
                    .wait_for_exit(shutdown.terminate_grace())
                    .await
                    .is_none()
                {
                    tracing::warn!(?pid, "Worker ignored SIGTERM; killing");
                    if let Err(err) = worker.force_kill() {
                        result = Err(err);
                    }
                    if worker
                        .wait_for_exit(shutdown.terminate_grace())
                        .await
                        .is_none()
                    {
                        tracing::error!(?pid, "Worker still alive after SIGKILL");
                    }
                }
            }
        }

        let rejected = self.transport.close("worker stopped").await;
        if rejected > 0 {
            tracing::debug!(?pid, rejected, "Rejected pending requests on stop");
        }
        result
    }
}

#[async_trait]
impl HealthTarget for Inner {
    fn should_poll(&self) -> bool {
        let state = self.state.lock();
        !state.shutting_down
            && matches!(
                state.phase,
                SupervisorPhase::Running | SupervisorPhase::Healthy | SupervisorPhase::Unhealthy
            )
    }

    async fn probe(&self) -> Result<(), TransportError> {
        self.transport.probe(self.options.probe_timeout).await
    }

    fn on_probe_success(&self) {
        {
            let mut state = self.state.lock();
            state.health.record_success(now_ms());
            state.backoff.reset();
            state.phase = SupervisorPhase::Healthy;
        }
        self.events.emit(EventKind::Healthy, "Worker is healthy");
    }

    fn on_probe_failure(&self, error: &TransportError) -> u32 {
        let failures = {
            let mut state = self.state.lock();
            state.phase = SupervisorPhase::Unhealthy;
            state.health.record_failure()
        };
        let max = self.options.health.max_retries;
        tracing::warn!(failures, max, error = %error, "Health check failed");
        self.events.emit(
            EventKind::Unhealthy,
            format!("Health check failed ({failures}/{max}): {error}"),
        );
        failures
    }

    fn on_failure_threshold(self: Arc<Self>) {
        // Off the monitor task: the failure path aborts the monitor.
        tokio::spawn(async move {
            Inner::handle_health_check_failure(&self).await;
        });
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        state.stop_health_polling();
        state.cancel_restart();
        if let Some(task) = state.exit_task.take() {
            task.abort();
        }
        if let Some(worker) = state.worker.take() {
            let _ = worker.force_kill();
        }
    }
}

async fn watch_exit(
    inner: Weak<Inner>,
    generation: u64,
    mut exit_rx: watch::Receiver<Option<WorkerExit>>,
) {
    // Err means the process task went away without reporting; still an exit.
    let _ = exit_rx.wait_for(Option::is_some).await;
    let exit = exit_rx.borrow().clone();
    if let Some(inner) = inner.upgrade() {
        Inner::on_worker_exit(&inner, generation, exit).await;
    }
}
