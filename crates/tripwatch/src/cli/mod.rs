//! Command-line interface for the `tripwatch` binary.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use commands::{
    ClearCommand, ConfigCommand, RunCommand, SourceArg, StatusCommand, TierArg,
};

use crate::logging::Verbosity;

/// tripwatch - Offline-resilient location telemetry
///
/// Samples positions, keeps them encrypted on disk while the network is
/// away, uploads them when it returns, and watches trip check-in deadlines.
#[derive(Debug, Parser)]
#[command(name = "tripwatch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the pipeline against a recorded track until Ctrl-C
    Run(RunCommand),

    /// Show buffered records and pending retries
    Status(StatusCommand),

    /// Upload everything buffered right now
    Flush,

    /// Delete buffered records
    Clear(ClearCommand),

    /// View or check configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> Verbosity {
        Verbosity::from_flags(self.quiet, self.verbose)
    }
}
