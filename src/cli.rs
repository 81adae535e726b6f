// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

/// Command-line arguments for `expctl`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "expctl",
    version,
    about = "Deploy, run and tear down a resource experiment described in TOML.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the experiment description (TOML).
    #[arg(long, value_name = "PATH", default_value = "Experiment.toml")]
    pub config: String,

    /// Number of worker threads (overrides `[controller].worker_threads`).
    #[arg(long, value_name = "N")]
    pub workers: Option<usize>,

    /// Give up waiting for the applications after this long (e.g. "30s").
    #[arg(long, value_name = "TIME")]
    pub timeout: Option<String>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `EXPCTL_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate, print the resources and conditions, but do not
    /// deploy anything.
    #[arg(long)]
    pub dry_run: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
