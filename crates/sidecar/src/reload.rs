//! Restart the worker when its configuration file changes.
//!
//! The parent directory is watched non-recursively and events are filtered
//! down to the one file. A change is only acted on once the file has stopped
//! changing (size and mtime stable for `stability_threshold_ms`) and the
//! debounce delay has passed without another change; a newer change restarts
//! that wait. Reloads closer than `min_reload_interval_ms` to the previous
//! completed reload are dropped.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::ReloadConfig;
use crate::error::{SupervisorError, WatchError};
use crate::events::{EventBus, EventKind, SidecarEvent, now_ms, system_time_ms};
use crate::supervisor::Supervisor;

/// Reason recorded for reloads requested through [`ReloadWatcher::force_reload`].
pub const MANUAL_RELOAD_REASON: &str = "manual-trigger";
const FILE_CHANGE_REASON: &str = "file-changed";

/// What a reload restarts.
#[async_trait]
pub trait ReloadTarget: Send + Sync + 'static {
    async fn stop(&self) -> Result<(), SupervisorError>;
    async fn start(&self) -> Result<(), SupervisorError>;
    fn worker_pid(&self) -> Option<u32>;
}

#[async_trait]
impl ReloadTarget for Supervisor {
    async fn stop(&self) -> Result<(), SupervisorError> {
        Supervisor::stop(self).await
    }

    async fn start(&self) -> Result<(), SupervisorError> {
        Supervisor::start(self).await
    }

    fn worker_pid(&self) -> Option<u32> {
        Supervisor::worker_pid(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadStatus {
    pub is_watching: bool,
    pub last_reload_at: Option<u64>,
    pub last_source_mtime: Option<u64>,
    pub reload_count: u64,
    pub is_reloading: bool,
    pub worker_pid: Option<u32>,
}

#[derive(Default)]
struct WatchState {
    watcher: Option<RecommendedWatcher>,
    event_task: Option<JoinHandle<()>>,
    /// Change waiting for the file to settle.
    pending: Option<JoinHandle<()>>,
    last_reload_at: Option<u64>,
    last_reload_instant: Option<Instant>,
    last_source_mtime: Option<u64>,
    reload_count: u64,
    is_reloading: bool,
}

struct WatcherInner {
    path: PathBuf,
    options: ReloadConfig,
    target: Arc<dyn ReloadTarget>,
    events: EventBus,
    state: Mutex<WatchState>,
}

#[derive(Clone)]
pub struct ReloadWatcher {
    inner: Arc<WatcherInner>,
}

impl ReloadWatcher {
    pub fn new(
        path: impl Into<PathBuf>,
        options: ReloadConfig,
        target: Arc<dyn ReloadTarget>,
        events: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(WatcherInner {
                path: path.into(),
                options,
                target,
                events,
                state: Mutex::new(WatchState::default()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Begin watching. Calling this while already watching does nothing.
    pub fn start_watching(&self) -> Result<(), WatchError> {
        let mut state = self.inner.state.lock();
        if state.watcher.is_some() {
            return Ok(());
        }

        let dir = match self.inner.path.parent() {
            Some(parent) if parent.as_os_str().is_empty() => Path::new("."),
            Some(parent) => parent,
            None => return Err(WatchError::NoParent(self.inner.path.clone())),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let _ = tx.send(res);
        })?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;

        state.event_task = Some(tokio::spawn(event_loop(Arc::downgrade(&self.inner), rx)));
        state.watcher = Some(watcher);
        tracing::info!(path = %self.inner.path.display(), "Watching config for changes");
        Ok(())
    }

    /// Stop watching, dropping any change still waiting to settle.
    pub fn stop_watching(&self) {
        let mut state = self.inner.state.lock();
        if let Some(task) = state.pending.take() {
            task.abort();
        }
        if let Some(task) = state.event_task.take() {
            task.abort();
        }
        if state.watcher.take().is_some() {
            tracing::info!(path = %self.inner.path.display(), "Stopped watching config");
        }
    }

    pub fn is_watching(&self) -> bool {
        self.inner.state.lock().watcher.is_some()
    }

    /// Reload now, bypassing the interval check. Returns false when another
    /// reload is in flight or the worker failed to come back.
    pub async fn force_reload(&self) -> bool {
        let mtime = file_mtime(&self.inner.path).await;
        WatcherInner::reload(&self.inner, MANUAL_RELOAD_REASON, mtime).await
    }

    /// Handle a settled change of the watched file.
    ///
    /// Returns whether a reload ran and succeeded.
    pub async fn on_config_changed(&self, source_mtime: Option<u64>) -> bool {
        WatcherInner::on_config_changed(&self.inner, source_mtime).await
    }

    pub fn status(&self) -> ReloadStatus {
        let state = self.inner.state.lock();
        ReloadStatus {
            is_watching: state.watcher.is_some(),
            last_reload_at: state.last_reload_at,
            last_source_mtime: state.last_source_mtime,
            reload_count: state.reload_count,
            is_reloading: state.is_reloading,
            worker_pid: self.inner.target.worker_pid(),
        }
    }

    pub fn shutdown(&self) {
        self.stop_watching();
    }
}

/// Clears `is_reloading` however the transaction ends.
struct ReloadGuard<'a> {
    inner: &'a WatcherInner,
}

impl Drop for ReloadGuard<'_> {
    fn drop(&mut self) {
        self.inner.state.lock().is_reloading = false;
    }
}

impl WatcherInner {
    fn on_file_event(this: &Arc<Self>) {
        let mut state = this.state.lock();
        if let Some(task) = state.pending.take() {
            task.abort();
        }
        state.pending = Some(tokio::spawn(settle_then_reload(Arc::downgrade(this))));
    }

    async fn on_config_changed(this: &Arc<Self>, source_mtime: Option<u64>) -> bool {
        {
            let state = this.state.lock();
            if let Some(last) = state.last_reload_instant {
                let since = last.elapsed();
                if since < this.options.min_reload_interval() {
                    tracing::debug!(?since, "Ignoring config change right after a reload");
                    return false;
                }
            }
        }
        WatcherInner::reload(this, FILE_CHANGE_REASON, source_mtime).await
    }

    async fn reload(this: &Arc<Self>, reason: &str, source_mtime: Option<u64>) -> bool {
        {
            let mut state = this.state.lock();
            if state.is_reloading {
                tracing::info!(reason, "Reload already in progress");
                return false;
            }
            state.is_reloading = true;
        }
        let _guard = ReloadGuard { inner: this };

        tracing::info!(reason, "Reloading worker");
        this.events.publish(
            SidecarEvent::new(EventKind::ReloadStarted, format!("Reloading worker ({reason})"))
                .with_source_mtime(source_mtime),
        );

        if let Err(err) = this.target.stop().await {
            tracing::warn!(error = %err, "Stop failed during reload; starting anyway");
        }
        tokio::time::sleep(this.options.restart_pause()).await;

        match this.target.start().await {
            Ok(()) => {
                let count = {
                    let mut state = this.state.lock();
                    state.reload_count += 1;
                    state.last_reload_at = Some(now_ms());
                    state.last_reload_instant = Some(Instant::now());
                    if source_mtime.is_some() {
                        state.last_source_mtime = source_mtime;
                    }
                    state.reload_count
                };
                tracing::info!(reason, count, "Reload completed");
                this.events.publish(
                    SidecarEvent::new(EventKind::ReloadCompleted, "Worker reloaded")
                        .with_source_mtime(source_mtime),
                );
                true
            }
            Err(err) => {
                tracing::error!(reason, error = %err, "Reload failed");
                this.events.publish(
                    SidecarEvent::new(EventKind::ReloadFailed, "Reload failed")
                        .with_source_mtime(source_mtime)
                        .with_error(err.to_string()),
                );
                false
            }
        }
    }

    fn is_target_event(&self, event: &notify::Event) -> bool {
        use notify::EventKind as Kind;

        if !matches!(event.kind, Kind::Create(_) | Kind::Modify(_) | Kind::Any) {
            return false;
        }
        let Some(name) = self.path.file_name() else {
            return false;
        };
        event
            .paths
            .iter()
            .any(|path| path.file_name() == Some(name))
    }
}

impl Drop for WatcherInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(task) = state.pending.take() {
            task.abort();
        }
        if let Some(task) = state.event_task.take() {
            task.abort();
        }
    }
}

async fn event_loop(
    inner: Weak<WatcherInner>,
    mut rx: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
) {
    while let Some(res) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match res {
            Ok(event) if inner.is_target_event(&event) => {
                tracing::debug!(kind = ?event.kind, "Config file event");
                WatcherInner::on_file_event(&inner);
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error = %err, "Config watcher error");
                inner.events.publish(
                    SidecarEvent::new(EventKind::WatchError, "Config watcher error")
                        .with_error(err.to_string()),
                );
            }
        }
    }
}

async fn settle_then_reload(inner: Weak<WatcherInner>) {
    let Some((path, options)) = inner
        .upgrade()
        .map(|inner| (inner.path.clone(), inner.options.clone()))
    else {
        return;
    };

    let mtime = wait_for_stable_write(&path, &options).await;
    tokio::time::sleep(options.debounce()).await;

    let Some(inner) = inner.upgrade() else {
        return;
    };
    // Past this point a newer change must not cancel a reload mid-flight.
    inner.state.lock().pending.take();
    WatcherInner::on_config_changed(&inner, mtime).await;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileSnapshot {
    len: u64,
    mtime: Option<u64>,
}

async fn snapshot(path: &Path) -> Option<FileSnapshot> {
    let metadata = tokio::fs::metadata(path).await.ok()?;
    Some(FileSnapshot {
        len: metadata.len(),
        mtime: metadata.modified().ok().and_then(system_time_ms),
    })
}

async fn file_mtime(path: &Path) -> Option<u64> {
    snapshot(path).await.and_then(|snapshot| snapshot.mtime)
}

/// Poll until size and mtime hold still for the stability threshold.
/// Returns the settled mtime, or `None` if the file is gone.
async fn wait_for_stable_write(path: &Path, options: &ReloadConfig) -> Option<u64> {
    let mut last = snapshot(path).await;
    let mut stable_since = Instant::now();
    loop {
        tokio::time::sleep(options.poll_interval()).await;
        let current = snapshot(path).await;
        if current != last {
            last = current;
            stable_since = Instant::now();
        } else if stable_since.elapsed() >= options.stability_threshold() {
            return last.and_then(|snapshot| snapshot.mtime);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio::sync::broadcast::Receiver;

    #[derive(Default)]
    struct FakeTarget {
        calls: Mutex<Vec<&'static str>>,
        fail_start: bool,
        fail_stop: bool,
        start_gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl ReloadTarget for FakeTarget {
        async fn stop(&self) -> Result<(), SupervisorError> {
            self.calls.lock().push("stop");
            if self.fail_stop {
                return Err(SupervisorError::Signal {
                    pid: 42,
                    message: "EPERM".to_string(),
                });
            }
            Ok(())
        }

        async fn start(&self) -> Result<(), SupervisorError> {
            self.calls.lock().push("start");
            if let Some(gate) = &self.start_gate {
                gate.notified().await;
            }
            if self.fail_start {
                return Err(SupervisorError::Spawn {
                    program: "worker".to_string(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                });
            }
            Ok(())
        }

        fn worker_pid(&self) -> Option<u32> {
            Some(4242)
        }
    }

    fn watcher(target: Arc<FakeTarget>) -> (ReloadWatcher, Receiver<SidecarEvent>) {
        let events = EventBus::new();
        let rx = events.subscribe();
        let watcher = ReloadWatcher::new(
            "/tmp/sidecar-test/config.yaml",
            ReloadConfig::default(),
            target,
            events,
        );
        (watcher, rx)
    }

    fn kinds(rx: &mut Receiver<SidecarEvent>) -> Vec<EventKind> {
        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind);
        }
        kinds
    }

    #[tokio::test(start_paused = true)]
    async fn force_reload_stops_then_starts() {
        let target = Arc::new(FakeTarget::default());
        let (watcher, mut rx) = watcher(target.clone());

        assert!(watcher.force_reload().await);

        assert_eq!(*target.calls.lock(), vec!["stop", "start"]);
        let status = watcher.status();
        assert_eq!(status.reload_count, 1);
        assert!(status.last_reload_at.is_some());
        assert!(!status.is_reloading);
        assert!(!status.is_watching);
        assert_eq!(status.worker_pid, Some(4242));
        assert_eq!(
            kinds(&mut rx),
            vec![EventKind::ReloadStarted, EventKind::ReloadCompleted]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn changes_right_after_a_reload_are_ignored() {
        let target = Arc::new(FakeTarget::default());
        let (watcher, _rx) = watcher(target.clone());

        assert!(watcher.on_config_changed(Some(1_000)).await);
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(!watcher.on_config_changed(Some(2_000)).await);
        assert!(!watcher.on_config_changed(Some(3_000)).await);

        assert_eq!(watcher.status().reload_count, 1);
        assert_eq!(watcher.status().last_source_mtime, Some(1_000));
        assert_eq!(target.calls.lock().len(), 2);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(watcher.on_config_changed(Some(4_000)).await);
        assert_eq!(watcher.status().reload_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_reload_is_a_no_op() {
        let gate = Arc::new(Notify::new());
        let target = Arc::new(FakeTarget {
            start_gate: Some(gate.clone()),
            ..FakeTarget::default()
        });
        let (watcher, _rx) = watcher(target.clone());

        let first = tokio::spawn({
            let watcher = watcher.clone();
            async move { watcher.force_reload().await }
        });
        while target.calls.lock().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(!watcher.force_reload().await);
        gate.notify_one();
        assert!(first.await.unwrap());
        assert_eq!(*target.calls.lock(), vec!["stop", "start"]);
        assert_eq!(watcher.status().reload_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_start_reports_and_leaves_count() {
        let target = Arc::new(FakeTarget {
            fail_start: true,
            fail_stop: true,
            ..FakeTarget::default()
        });
        let (watcher, mut rx) = watcher(target.clone());

        assert!(!watcher.force_reload().await);

        assert_eq!(*target.calls.lock(), vec!["stop", "start"]);
        let status = watcher.status();
        assert_eq!(status.reload_count, 0);
        assert!(!status.is_reloading);

        assert_eq!(rx.try_recv().unwrap().kind, EventKind::ReloadStarted);
        let failed = rx.try_recv().unwrap();
        assert_eq!(failed.kind, EventKind::ReloadFailed);
        assert!(failed.error.unwrap().contains("worker"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_reload_clears_the_guard() {
        let gate = Arc::new(Notify::new());
        let target = Arc::new(FakeTarget {
            start_gate: Some(gate),
            ..FakeTarget::default()
        });
        let (watcher, _rx) = watcher(target);

        let pending = tokio::spawn({
            let watcher = watcher.clone();
            async move { watcher.force_reload().await }
        });
        while !watcher.status().is_reloading {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        pending.abort();
        let _ = pending.await;

        assert!(!watcher.status().is_reloading);
    }

    #[test]
    fn only_the_watched_file_triggers() {
        let (watcher, _rx) = watcher(Arc::new(FakeTarget::default()));
        let inner = &watcher.inner;

        let modify = notify::Event::new(notify::EventKind::Modify(notify::event::ModifyKind::Any));
        assert!(inner.is_target_event(&modify.clone().add_path("/tmp/sidecar-test/config.yaml".into())));
        assert!(!inner.is_target_event(&modify.add_path("/tmp/sidecar-test/other.yaml".into())));

        let access = notify::Event::new(notify::EventKind::Access(notify::event::AccessKind::Any))
            .add_path("/tmp/sidecar-test/config.yaml".into());
        assert!(!inner.is_target_event(&access));
    }
}
