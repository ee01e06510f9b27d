//! Subscriber setup for the `sidecar` binary and tests.
//!
//! Environment variables:
//! - `RUST_LOG` - filter directive (default: `info`)
//! - `LOG_FORMAT` - `json` or `pretty` (default: `pretty`)
//! - `TEST_LOG` - if set, tests print logs

use std::str::FromStr;

use tracing::subscriber::SetGlobalDefaultError;
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry, fmt};

pub const DEFAULT_FILTER: &str = "info";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "" => Ok(Self::Pretty),
            other => Err(format!("unknown log format `{other}`")),
        }
    }
}

impl LogFormat {
    /// Read `LOG_FORMAT`, falling back to pretty output.
    pub fn from_env() -> Self {
        std::env::var("LOG_FORMAT")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or_default()
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber.
pub fn init(format: LogFormat) -> Result<(), SetGlobalDefaultError> {
    // Another logger may already own `log`; tracing output still works.
    let _ = LogTracer::init();

    match format {
        LogFormat::Json => {
            let subscriber = Registry::default().with(env_filter()).with(
                fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
        LogFormat::Pretty => {
            let subscriber = Registry::default().with(env_filter()).with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
    }
}

/// Logs for tests, only when `TEST_LOG` is set. Safe to call repeatedly.
pub fn init_test() {
    if std::env::var_os("TEST_LOG").is_none() {
        return;
    }

    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = LogTracer::init();
        let subscriber = Registry::default()
            .with(env_filter())
            .with(fmt::layer().with_target(true).with_test_writer());
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_formats() {
        assert_eq!("json".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert_eq!("PRETTY".parse::<LogFormat>(), Ok(LogFormat::Pretty));
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
