use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;
use sidecar::events::EventKind;
use sidecar::logging::{self, LogFormat};
use sidecar::{SidecarService, load_config};
use sidecar_rpc::{Connector, RpcClient, RpcClientConfig, TcpConnector};
use tokio::sync::broadcast;

#[derive(Parser, Debug)]
#[command(name = "sidecar", about = "Supervise a worker process", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the worker and keep it alive until interrupted
    Run {
        /// Config file (default: <config dir>/sidecar/sidecar.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Send one JSON-RPC request to a running worker
    Call {
        /// Unix socket the worker listens on
        #[arg(long, conflicts_with = "tcp", required_unless_present = "tcp")]
        socket: Option<PathBuf>,
        /// TCP address (host:port) the worker listens on
        #[arg(long)]
        tcp: Option<String>,
        method: String,
        /// Params as JSON
        params: Option<String>,
        #[arg(long, default_value_t = 30_000)]
        timeout_ms: u64,
    },
    /// Check a config file without starting anything
    Validate {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(LogFormat::from_env()).context("failed to install logger")?;

    match cli.command {
        Command::Run { config } => run(resolve_config_path(config)?).await,
        Command::Call {
            socket,
            tcp,
            method,
            params,
            timeout_ms,
        } => call(socket, tcp, &method, params.as_deref(), timeout_ms).await,
        Command::Validate { config } => {
            let path = resolve_config_path(config)?;
            load_config(&path).with_context(|| format!("{} is not valid", path.display()))?;
            println!("{} is valid", path.display());
            Ok(())
        }
    }
}

fn resolve_config_path(explicit: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }
    let dir = dirs::config_dir().context("no config directory; pass --config")?;
    Ok(dir.join("sidecar").join("sidecar.toml"))
}

async fn run(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let service = SidecarService::new(config).context("failed to set up transport")?;
    let mut events = service.subscribe();

    let started = service.start().await;
    if !started.success {
        bail!(
            "worker failed to start: {}",
            started.error.unwrap_or_default()
        );
    }
    tracing::info!(base_url = %service.base_url(), "Sidecar running");

    let watching = service.start_watching();
    if let Some(error) = watching.error {
        tracing::warn!(%error, "Config watcher unavailable; hot reload disabled");
    }

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => match event.kind {
                    EventKind::Error | EventKind::ReloadFailed | EventKind::WatchError
                    | EventKind::CircuitBreakerOpen => {
                        tracing::warn!(kind = ?event.kind, error = ?event.error, "{}", event.message);
                    }
                    _ => tracing::info!(kind = ?event.kind, "{}", event.message),
                },
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Event log fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = &mut shutdown => {
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    let stopped = service.shutdown().await;
    if let Some(error) = stopped.error {
        bail!("worker did not stop cleanly: {error}");
    }
    Ok(())
}

async fn call(
    socket: Option<PathBuf>,
    tcp: Option<String>,
    method: &str,
    params: Option<&str>,
    timeout_ms: u64,
) -> Result<()> {
    let connector: Arc<dyn Connector> = match (socket, tcp) {
        (_, Some(addr)) => Arc::new(TcpConnector::new(addr)),
        #[cfg(unix)]
        (Some(path), None) => Arc::new(sidecar_rpc::UnixSocketConnector::new(path)),
        #[cfg(not(unix))]
        (Some(_), None) => bail!("--socket needs a Unix platform; use --tcp"),
        (None, None) => bail!("one of --socket or --tcp is required"),
    };
    let params: Option<Value> = params
        .map(serde_json::from_str)
        .transpose()
        .context("params must be valid JSON")?;

    let client = RpcClient::new(connector, RpcClientConfig::default());
    let result = client
        .call(method, params, Some(Duration::from_millis(timeout_ms)))
        .await
        .with_context(|| format!("{method} failed"))?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    client.disconnect("done").await;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
