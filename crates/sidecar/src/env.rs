//! Environment handed to the worker process.

use std::collections::BTreeMap;
use std::ffi::OsString;

use crate::config::{EnvPolicy, WorkerConfig};

/// Variables a sandboxed worker needs to function at all.
pub const DEFAULT_ALLOW_LIST: &[&str] = &["PATH", "HOME", "USER", "LANG"];

/// The supervisor's own environment, minus entries that are not valid UTF-8.
pub fn ambient_env() -> impl Iterator<Item = (String, String)> {
    utf8_vars(std::env::vars_os())
}

/// Keep only entries whose name and value are both UTF-8. The rest are
/// skipped with a debug log instead of aborting the launch.
pub fn utf8_vars<I>(vars: I) -> impl Iterator<Item = (String, String)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    vars.into_iter()
        .filter_map(|(name, value)| match (name.into_string(), value.into_string()) {
            (Ok(name), Ok(value)) => Some((name, value)),
            (name, _) => {
                let name = name.unwrap_or_else(|raw| raw.to_string_lossy().into_owned());
                tracing::debug!(%name, "Skipping non-UTF-8 environment variable");
                None
            }
        })
}

/// Build the worker environment from `ambient` (normally [`ambient_env`]).
///
/// Under [`EnvPolicy::AllowList`] anything not named in `env_allow` is
/// withheld, credentials included. Explicit `env` entries always win.
pub fn worker_env<I>(config: &WorkerConfig, ambient: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut env: BTreeMap<String, String> = match config.env_policy {
        EnvPolicy::Inherit => ambient.into_iter().collect(),
        EnvPolicy::AllowList => ambient
            .into_iter()
            .filter(|(name, _)| config.env_allow.iter().any(|allowed| allowed == name))
            .collect(),
    };
    env.extend(
        config
            .env
            .iter()
            .map(|(name, value)| (name.clone(), value.clone())),
    );
    env
}
