//! Liveness bookkeeping and the periodic health probe loop.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::backoff::Backoff;
use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrashPolicy {
    pub max_crashes: usize,
    pub window: Duration,
}

/// What to do about a crash that was just recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashVerdict {
    Restart { delay: Duration },
    OpenCircuit { crashes: usize },
}

/// Failure counters for the current worker plus the sliding crash window.
#[derive(Debug, Clone, Default)]
pub struct HealthState {
    pub failure_count: u32,
    /// Epoch milliseconds of the last successful probe.
    pub last_healthy_at: Option<u64>,
    crashes: VecDeque<Instant>,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget crashes older than `window`.
    pub fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.crashes.front() {
            if now.saturating_duration_since(*oldest) >= window {
                self.crashes.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn recent_crashes(&self) -> usize {
        self.crashes.len()
    }

    pub fn circuit_open(&self, max_crashes: usize) -> bool {
        self.crashes.len() >= max_crashes
    }

    pub fn clear_crashes(&mut self) {
        self.crashes.clear();
    }

    pub fn record_success(&mut self, at_ms: u64) {
        self.failure_count = 0;
        self.last_healthy_at = Some(at_ms);
    }

    /// Returns the new consecutive failure count.
    pub fn record_failure(&mut self) -> u32 {
        self.failure_count = self.failure_count.saturating_add(1);
        self.failure_count
    }

    pub fn reset_failures(&mut self) {
        self.failure_count = 0;
    }

    /// Record a crash at `now` and decide between a delayed restart and
    /// opening the circuit. Advances `backoff` only when restarting.
    pub fn register_crash(
        &mut self,
        now: Instant,
        policy: CrashPolicy,
        backoff: &mut Backoff,
    ) -> CrashVerdict {
        self.crashes.push_back(now);
        self.prune(now, policy.window);

        let crashes = self.crashes.len();
        if crashes >= policy.max_crashes {
            CrashVerdict::OpenCircuit { crashes }
        } else {
            CrashVerdict::Restart {
                delay: backoff.advance(),
            }
        }
    }
}

/// Whatever the monitor keeps alive. Implemented by the supervisor.
#[async_trait]
pub trait HealthTarget: Send + Sync + 'static {
    /// False once polling must stop (shutdown began, circuit open, worker gone).
    fn should_poll(&self) -> bool;

    async fn probe(&self) -> Result<(), TransportError>;

    fn on_probe_success(&self);

    /// Returns the consecutive failure count after this failure.
    fn on_probe_failure(&self, error: &TransportError) -> u32;

    /// Called once the failure count reaches the retry limit.
    fn on_failure_threshold(self: Arc<Self>);
}

#[derive(Debug, Clone, Copy)]
pub struct HealthMonitor {
    pub interval: Duration,
    pub settle_delay: Duration,
    pub max_retries: u32,
}

impl HealthMonitor {
    /// Poll `target` every `interval` after `settle_delay`, until it says
    /// stop or goes away.
    pub fn spawn<T: HealthTarget>(self, target: Weak<T>) -> JoinHandle<()> {
        tokio::spawn(self.run(target))
    }

    async fn run<T: HealthTarget>(self, target: Weak<T>) {
        tokio::time::sleep(self.settle_delay).await;
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let Some(strong) = target.upgrade() else {
                return;
            };
            if !strong.should_poll() {
                tracing::debug!("Health polling stopped");
                return;
            }

            match strong.probe().await {
                Ok(()) => strong.on_probe_success(),
                Err(err) => {
                    let failures = strong.on_probe_failure(&err);
                    if failures >= self.max_retries {
                        strong.on_failure_threshold();
                    }
                }
            }
        }
    }
}
