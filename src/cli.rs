// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Command-line arguments for `fovdag`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "fovdag",
    version,
    about = "Run per-FOV imaging pipeline stages in dependency order, with retries and resume.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the pipeline document (`.json` or `.toml`).
    ///
    /// Default: `pipeline.json` in the current working directory.
    #[arg(long, global = true, value_name = "PATH", default_value = "pipeline.json")]
    pub config: PathBuf,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `FOVDAG_LOG` or a default level will be used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Load, resolve and bind the pipeline; report every problem found.
    Validate,
    /// Print stages in dependency order with fragment counts and estimates.
    Plan,
    /// Forget previous progress and run every stage.
    Run(RunArgs),
    /// Run only what previous runs left incomplete.
    Resume(RunArgs),
    /// Print per-stage completion from the status store.
    Status,
    /// Forget the recorded progress of a stage.
    Reset {
        /// Stage instance name.
        stage: String,
        /// Also reset every stage downstream of it.
        #[arg(long)]
        with_dependents: bool,
    },
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Cap on concurrently running fragments (overrides `execution.max_workers`).
    #[arg(long, value_name = "N")]
    pub max_workers: Option<usize>,
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

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
