// src/logging.rs

//! Logging setup for `expctl` using `tracing` + `tracing-subscriber`.
//!
//! The filter comes from, in order:
//! 1. the `--log-level` CLI flag, applied to every target
//! 2. the `EXPCTL_LOG` environment variable, read as `EnvFilter` directives
//!    (e.g. `"info"` or `"expctl::engine=debug,warn"`)
//! 3. `info`
//!
//! Logs go to STDERR; STDOUT is reserved for trace output printed by the CLI.

use anyhow::Result;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::LogLevel;

const ENV_VAR: &str = "EXPCTL_LOG";

/// Install the global logging subscriber.
///
/// Fails if a global subscriber is already installed, so a second call
/// returns an error instead of replacing the first one.
pub fn init_logging(cli_level: Option<LogLevel>) -> Result<()> {
    fmt()
        .with_env_filter(filter_for(cli_level))
        .with_target(true)
        .with_thread_names(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("initialising tracing subscriber: {e}"))
}

fn filter_for(cli_level: Option<LogLevel>) -> EnvFilter {
    if let Some(level) = cli_level {
        return EnvFilter::new(directive(level));
    }
    // Malformed directives fall back to the default instead of failing.
    EnvFilter::try_from_env(ENV_VAR).unwrap_or_else(|_| EnvFilter::new("info"))
}

fn directive(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    }
}
