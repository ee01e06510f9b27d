use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sidecar::config::ReloadConfig;
use sidecar::error::SupervisorError;
use sidecar::{EventBus, EventKind, ReloadTarget, ReloadWatcher};

#[derive(Default)]
struct CountingTarget {
    stops: AtomicUsize,
    starts: AtomicUsize,
}

#[async_trait]
impl ReloadTarget for CountingTarget {
    async fn stop(&self) -> Result<(), SupervisorError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn start(&self) -> Result<(), SupervisorError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn worker_pid(&self) -> Option<u32> {
        None
    }
}

fn fast_options() -> ReloadConfig {
    ReloadConfig {
        path: None,
        debounce_ms: 150,
        min_reload_interval_ms: 2_000,
        stability_threshold_ms: 50,
        poll_interval_ms: 20,
        restart_pause_ms: 10,
    }
}

#[tokio::test]
async fn burst_of_writes_reloads_once() {
    sidecar::logging::init_test();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, "model: a\n").unwrap();

    let events = EventBus::new();
    let mut rx = events.subscribe();
    let target = Arc::new(CountingTarget::default());
    let watcher = ReloadWatcher::new(&path, fast_options(), target.clone(), events);
    watcher.start_watching().unwrap();
    watcher.start_watching().unwrap();
    assert!(watcher.is_watching());

    for model in ["b", "c", "d"] {
        std::fs::write(&path, format!("model: {model}\n")).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let completed = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(event) if event.kind == EventKind::ReloadCompleted => return event,
                _ => {}
            }
        }
    })
    .await
    .expect("no reload");
    assert!(completed.source_mtime.is_some());

    // Let any stragglers settle; they fall inside the minimum interval.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(target.starts.load(Ordering::SeqCst), 1);
    assert_eq!(target.stops.load(Ordering::SeqCst), 1);

    let status = watcher.status();
    assert_eq!(status.reload_count, 1);
    assert!(status.is_watching);
    assert_eq!(status.last_source_mtime, completed.source_mtime);

    watcher.stop_watching();
    assert!(!watcher.is_watching());
}

#[tokio::test]
async fn stop_watching_drops_a_pending_change() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, "model: a\n").unwrap();

    let target = Arc::new(CountingTarget::default());
    let mut options = fast_options();
    options.debounce_ms = 1_000;
    let watcher = ReloadWatcher::new(&path, options, target.clone(), EventBus::new());
    watcher.start_watching().unwrap();

    std::fs::write(&path, "model: b\n").unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    watcher.stop_watching();

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(target.starts.load(Ordering::SeqCst), 0);
    assert_eq!(watcher.status().reload_count, 0);
}
