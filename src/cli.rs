use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::context::Params;

/// hostops - run host maintenance procedures as ordered, logged steps
#[derive(Parser)]
#[command(name = "hostops")]
#[command(about = "Run host maintenance procedures as ordered, logged steps")]
#[command(version)]
pub struct Cli {
    /// Path to a JSON configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory for per-run log files (overrides the configuration)
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    /// Dry-run mode: show what would be executed without making changes.
    ///
    /// Mutating commands (upgrades, dumps, firewall rules) are skipped and
    /// logged. Read-only probes (df, id, grep) still execute so the preview
    /// is realistic.
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Never prompt; required inputs must come from flags
    #[arg(long, global = true)]
    pub non_interactive: bool,

    /// Do not require root (development only)
    #[arg(long, global = true)]
    pub skip_root_check: bool,

    /// Run only these steps (repeatable)
    #[arg(long = "only", value_name = "STEP", global = true)]
    pub only: Vec<String>,

    /// Skip these steps (repeatable)
    #[arg(long = "skip", value_name = "STEP", global = true)]
    pub skip: Vec<String>,

    /// Write the final run report as JSON to this path
    #[arg(long, value_name = "PATH", global = true)]
    pub report_json: Option<PathBuf>,

    /// Default per-command timeout in seconds (0 disables)
    #[arg(long, value_name = "SECS", global = true)]
    pub timeout: Option<u64>,

    /// Disable coloured console output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Refresh the package index, upgrade packages and clean up
    SystemUpdate,
    /// Dump databases, archive configuration and prune old backups
    Backup,
    /// Enable the firewall, audit SSH and tighten network settings
    Harden,
    /// Check disk, memory, load and service health against thresholds
    Monitor,
    /// Create a local user account
    AddUser {
        /// Login name (prompted for when omitted)
        #[arg(short, long)]
        username: Option<String>,
        /// Comma separated supplementary groups
        #[arg(short, long)]
        groups: Option<String>,
    },
    /// List procedures and their steps
    List,
    /// Validate a configuration file
    ValidateConfig {
        /// Path to configuration file to validate
        path: PathBuf,
    },
}

impl Commands {
    /// Procedure name for commands that start a run
    pub fn procedure(&self) -> Option<&'static str> {
        match self {
            Self::SystemUpdate => Some("system-update"),
            Self::Backup => Some("backup"),
            Self::Harden => Some("harden"),
            Self::Monitor => Some("monitor"),
            Self::AddUser { .. } => Some("add-user"),
            Self::List | Self::ValidateConfig { .. } => None,
        }
    }

    /// Procedure parameters given as flags
    pub fn params(&self) -> Params {
        let mut params = Params::new();
        if let Self::AddUser { username, groups } = self {
            if let Some(username) = username {
                params.insert("username".to_string(), username.clone());
            }
            if let Some(groups) = groups {
                params.insert("groups".to_string(), groups.clone());
            }
        }
        params
    }
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}
