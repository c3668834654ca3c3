//! Command-line arguments.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "casesync", version, about = "Collaborative case sessions from the terminal")]
pub struct Cli {
    /// Case server URL
    #[arg(long, env = "CASESYNC_SERVER", global = true)]
    pub server: Option<String>,

    /// Bearer token for the case server
    #[arg(long, env = "CASESYNC_TOKEN", global = true, hide_env_values = true)]
    pub token: Option<String>,

    /// Config file (default: ~/.config/casesync/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Snapshot cache directory
    #[arg(long, global = true)]
    pub cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Open a case session and edit it interactively
    Watch {
        /// Case id
        case_id: String,

        /// Start in offline mode (cached data only)
        #[arg(long)]
        offline: bool,
    },

    /// Print a reference list (live, or cached when offline)
    Reference {
        /// firms, users, vehicles, locations, medications or hospitals
        category: String,

        /// Use only the cache
        #[arg(long)]
        offline: bool,
    },

    /// Inspect or manage the local snapshot cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Show or update the config file
    Config {
        /// Set the server URL
        #[arg(long)]
        set_server: Option<String>,

        /// Set the auth token
        #[arg(long)]
        set_token: Option<String>,

        /// Set the user id
        #[arg(long)]
        set_user: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum CacheCommands {
    /// List cached snapshots
    Stats,
    /// Delete every cached snapshot
    Clear,
    /// Download reference lists that are missing or out of date
    Preload {
        /// Download every list, even ones that are still current
        #[arg(long)]
        force: bool,
    },
}
