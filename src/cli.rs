// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, Subcommand, ValueEnum};

/// Command-line arguments for `forecycle`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "forecycle",
    version,
    about = "Drive scheduled forecast cycles through a chain of external model stages.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `Forecycle.toml` in the current working directory.
    #[arg(long, global = true, value_name = "PATH", default_value = "Forecycle.toml")]
    pub config: String,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `FORECYCLE_LOG` or a default level will be used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run the scheduler loop: poll for due cycles and drive them.
    Run {
        /// Poll once, drive every due or resumable cycle to a stop, then exit.
        #[arg(long)]
        once: bool,
    },

    /// Ask a running daemon to poll immediately.
    Poll,

    /// Report active and recent cycles.
    Status {
        /// Include acknowledged failures.
        #[arg(long)]
        all: bool,

        /// Print records as JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Re-arm a FAILED_TERMINAL cycle so the scheduler resumes it.
    Retry {
        #[arg(value_name = "CYCLE_ID")]
        cycle_id: String,
    },

    /// Abort a cycle; it becomes FAILED_TERMINAL and any running stage is killed.
    Cancel {
        #[arg(value_name = "CYCLE_ID")]
        cycle_id: String,
    },

    /// Acknowledge a FAILED_TERMINAL cycle, hiding it from default status output.
    Ack {
        #[arg(value_name = "CYCLE_ID")]
        cycle_id: String,
    },

    /// Delete terminal cycle records older than the retention window.
    Prune,

    /// Parse + validate the config and print the chains, without running anything.
    Check,
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
