//! CLI command definitions.

use std::path::PathBuf;

use clap::{Args, Subcommand, ValueEnum};

use crate::position::{SourceKind, Tier};

/// Arguments for `tripwatch run`.
#[derive(Debug, Args)]
pub struct RunCommand {
    /// JSON-lines track to replay as the position source
    #[arg(short, long, value_name = "FILE")]
    pub track: PathBuf,

    /// JSON file with the trip's destinations; enables check-in monitoring
    #[arg(short, long, value_name = "FILE")]
    pub destinations: Option<PathBuf>,

    /// Kind of source the track was recorded with
    #[arg(long, value_enum, default_value = "device")]
    pub source: SourceArg,

    /// Start in offline mode
    #[arg(long)]
    pub offline: bool,
}

/// Status command arguments.
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Clear command arguments.
#[derive(Debug, Args)]
pub struct ClearCommand {
    /// Which tier to clear
    #[arg(short, long, value_enum)]
    pub tier: TierArg,
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show the configuration file path
    Path,

    /// Validate configuration
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

/// Position source kind argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SourceArg {
    /// Dedicated GNSS sensor
    Device,
    /// Browser-style geolocation
    Browser,
}

impl From<SourceArg> for SourceKind {
    fn from(arg: SourceArg) -> Self {
        match arg {
            SourceArg::Device => Self::DeviceSensor,
            SourceArg::Browser => Self::BrowserGeolocation,
        }
    }
}

/// Tier selection argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TierArg {
    /// Records captured while online
    Online,
    /// Records captured while offline
    Offline,
    /// Both tiers
    All,
}

impl TierArg {
    /// Tiers this argument selects.
    #[must_use]
    pub fn tiers(self) -> &'static [Tier] {
        match self {
            Self::Online => &[Tier::Online],
            Self::Offline => &[Tier::Offline],
            Self::All => &Tier::ALL,
        }
    }
}
