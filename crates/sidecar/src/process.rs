//! Handle to a spawned worker process.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};

use crate::config::WorkerConfig;
use crate::error::SupervisorError;

/// Log target for lines the worker prints.
pub const WORKER_LOG_TARGET: &str = "sidecar::worker";

/// Fully resolved launch parameters. `env` is the complete environment; the
/// supervisor's own variables are never inherited implicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl WorkerSpec {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            cwd: config.cwd.clone(),
            env: crate::env::worker_env(config, crate::env::ambient_env()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub code: Option<i32>,
    /// Terminating signal, Unix only.
    pub signal: Option<i32>,
    /// Set when the exit status could not be collected.
    pub error: Option<String>,
}

impl WorkerExit {
    fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
            error: None,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.error, self.code, self.signal) {
            (Some(error), _, _) => write!(f, "wait failed: {error}"),
            (None, Some(code), _) => write!(f, "exit code {code}"),
            (None, None, Some(signal)) => write!(f, "killed by signal {signal}"),
            (None, None, None) => write!(f, "exited"),
        }
    }
}

/// A running (or exited) worker.
///
/// A background task owns the OS child and publishes its exit exactly once;
/// the handle itself only signals and observes.
#[derive(Debug)]
pub struct WorkerProcess {
    pid: Option<u32>,
    program: String,
    exit_rx: watch::Receiver<Option<WorkerExit>>,
    kill_tx: mpsc::UnboundedSender<()>,
}

impl WorkerProcess {
    pub fn spawn(spec: &WorkerSpec) -> Result<Self, SupervisorError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .env_clear()
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|source| SupervisorError::Spawn {
            program: spec.program.clone(),
            source,
        })?;
        let pid = child.id();
        tracing::info!(program = %spec.program, ?pid, "Spawned worker");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, pid, false));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, pid, true));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, mut kill_rx) = mpsc::unbounded_channel::<()>();
        tokio::spawn(async move {
            let outcome = loop {
                tokio::select! {
                    status = child.wait() => break status,
                    Some(()) = kill_rx.recv() => {
                        if let Err(err) = child.start_kill() {
                            tracing::warn!(?pid, error = %err, "Failed to kill worker");
                        }
                    }
                }
            };
            let exit = match outcome {
                Ok(status) => WorkerExit::from_status(status),
                Err(err) => WorkerExit {
                    code: None,
                    signal: None,
                    error: Some(err.to_string()),
                },
            };
            tracing::debug!(?pid, %exit, "Worker exited");
            let _ = exit_tx.send(Some(exit));
        });

        Ok(Self {
            pid,
            program: spec.program.clone(),
            exit_rx,
            kill_tx,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn is_alive(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    pub fn exit(&self) -> Option<WorkerExit> {
        self.exit_rx.borrow().clone()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_rx.borrow().as_ref().and_then(|exit| exit.code)
    }

    /// Receiver that flips to `Some` once the process is gone.
    pub fn exit_watch(&self) -> watch::Receiver<Option<WorkerExit>> {
        self.exit_rx.clone()
    }

    /// Wait up to `timeout` for the process to exit.
    pub async fn wait_for_exit(&self, timeout: Duration) -> Option<WorkerExit> {
        let mut exit_rx = self.exit_rx.clone();
        match tokio::time::timeout(timeout, exit_rx.wait_for(Option::is_some)).await {
            Ok(Ok(exit)) => exit.clone(),
            // The owning task is gone without reporting, e.g. runtime shutdown.
            Ok(Err(_closed)) => self.exit(),
            Err(_elapsed) => None,
        }
    }

    /// Ask the worker to exit (SIGTERM).
    pub fn terminate(&self) -> Result<(), SupervisorError> {
        if !self.is_alive() {
            return Ok(());
        }

        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            let Some(pid) = self.pid else {
                return Ok(());
            };
            match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) | Err(Errno::ESRCH) => Ok(()),
                Err(err) => Err(SupervisorError::Signal {
                    pid,
                    message: err.to_string(),
                }),
            }
        }

        #[cfg(not(unix))]
        {
            self.force_kill()
        }
    }

    /// Kill the worker outright (SIGKILL on Unix).
    pub fn force_kill(&self) -> Result<(), SupervisorError> {
        if !self.is_alive() {
            return Ok(());
        }
        // A closed channel means the owning task already saw the exit.
        let _ = self.kill_tx.send(());
        Ok(())
    }
}

async fn forward_output<R>(stream: R, pid: Option<u32>, is_stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if is_stderr => {
                tracing::warn!(target: WORKER_LOG_TARGET, ?pid, "{line}");
            }
            Ok(Some(line)) => {
                tracing::info!(target: WORKER_LOG_TARGET, ?pid, "{line}");
            }
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(?pid, error = %err, "Worker output stream closed");
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn shell(script: &str) -> WorkerSpec {
        let mut env = BTreeMap::new();
        if let Ok(path) = std::env::var("PATH") {
            env.insert("PATH".to_string(), path);
        }
        WorkerSpec {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            cwd: None,
            env,
        }
    }

    #[tokio::test]
    async fn reports_exit_code() {
        let worker = WorkerProcess::spawn(&shell("exit 3")).unwrap();
        let exit = worker.wait_for_exit(Duration::from_secs(5)).await.unwrap();
        assert_eq!(exit.code, Some(3));
        assert!(!worker.is_alive());
        assert_eq!(worker.exit_code(), Some(3));
    }

    #[tokio::test]
    async fn terminate_delivers_sigterm() {
        let worker = WorkerProcess::spawn(&shell("exec sleep 30")).unwrap();
        assert!(worker.is_alive());
        assert!(worker.wait_for_exit(Duration::from_millis(50)).await.is_none());

        worker.terminate().unwrap();
        let exit = worker.wait_for_exit(Duration::from_secs(5)).await.unwrap();
        assert_eq!(exit.signal, Some(nix::sys::signal::Signal::SIGTERM as i32));
    }

    #[tokio::test]
    async fn force_kill_ends_a_process_ignoring_sigterm() {
        let worker =
            WorkerProcess::spawn(&shell("trap '' TERM; while true; do sleep 0.05; done")).unwrap();
        // Let the shell install its trap.
        tokio::time::sleep(Duration::from_millis(100)).await;
        worker.terminate().unwrap();
        assert!(worker.wait_for_exit(Duration::from_millis(200)).await.is_none());

        worker.force_kill().unwrap();
        let exit = worker.wait_for_exit(Duration::from_secs(5)).await.unwrap();
        assert_eq!(exit.signal, Some(nix::sys::signal::Signal::SIGKILL as i32));
    }

    #[tokio::test]
    async fn environment_is_exactly_what_was_given() {
        let mut spec = shell(r#"test "$GREETING" = hi && test -z "$HOME""#);
        spec.env.insert("GREETING".to_string(), "hi".to_string());
        let worker = WorkerProcess::spawn(&spec).unwrap();
        let exit = worker.wait_for_exit(Duration::from_secs(5)).await.unwrap();
        assert!(exit.success(), "{exit}");
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let spec = WorkerSpec {
            program: "/nonexistent/worker-binary".to_string(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
        };
        let err = WorkerProcess::spawn(&spec).unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
    }
}
