//! Command-line flags. Every flag is an override for the matching [`llamafleet_runtime::AppConfig`]
//! field; CLI values win over the config file, which wins over built-in defaults.

use std::path::PathBuf;

use clap::Parser;

/// llamafleet — control plane for a fleet of local inference-server processes
#[derive(Parser, Debug)]
#[command(name = "llamafleet", version, about, long_about = None)]
pub struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long, default_value = "llamafleet.toml")]
    pub config: PathBuf,

    /// Address the control-plane HTTP server binds to.
    #[arg(long)]
    pub listen_addr: Option<String>,

    /// Maximum number of concurrently running instances.
    #[arg(long)]
    pub max_running_instances: Option<usize>,

    /// Directory holding persisted instance snapshots.
    #[arg(long)]
    pub state_dir: Option<PathBuf>,

    /// Directory holding per-instance log files.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Restart instances whose persisted desired-running flag was true.
    #[arg(long)]
    pub restore_last_state: bool,

    /// Tracing filter directive, e.g. `info` or `llamafleet=debug`.
    #[arg(long)]
    pub log_level: Option<String>,
}
