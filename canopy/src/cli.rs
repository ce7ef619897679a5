//! Command-line interface definition.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "canopy")]
#[command(version)]
#[command(about = "Canopy - per-worktree dev server supervisor")]
pub struct Cli {
    /// Control socket path (defaults to ~/.canopy/canopyd.sock)
    #[arg(long, global = true, env = "CANOPY_SOCKET")]
    pub socket: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a dev server for a worktree
    Start {
        /// Working directory of the worktree
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Launch command (defaults to `npm run dev`)
        #[arg(long)]
        run: Option<String>,

        /// Arguments for the launch command
        #[arg(long = "arg", value_name = "ARG", allow_hyphen_values = true)]
        args: Vec<String>,

        /// Extra substring that counts as a readiness signal
        #[arg(long)]
        ready_sentinel: Option<String>,
    },

    /// Stop the dev server for a worktree
    Stop {
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Show one server record
    Status {
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// List all managed servers
    List,

    /// Show (or follow) captured output
    Logs {
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Number of lines from the end of the buffer
        #[arg(long)]
        tail: Option<usize>,

        /// Keep streaming new lines
        #[arg(long, short = 'f')]
        follow: bool,
    },

    /// Manage proxy routes for a worktree's server
    Proxy {
        #[command(subcommand)]
        action: ProxyAction,
    },

    /// Daemon health summary
    Health,

    /// Stop the daemon (managed servers keep running detached)
    Shutdown,
}

#[derive(Subcommand)]
pub enum ProxyAction {
    /// Forward the configured ports to this worktree's server
    Enable {
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Remove the forwarding routes
    Disable {
        #[arg(default_value = ".")]
        path: PathBuf,
    },
}
