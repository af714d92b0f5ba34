//! CLI argument parsing.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "opencode-sidecar")]
#[command(about = "Runs opencode and serves JSON commands over stdin/stdout")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Launch opencode and serve commands on stdin/stdout [default]
    Serve(ServeArgs),

    /// Report whether the opencode CLI is installed
    Check {
        /// opencode binary (defaults to OPENCODE_CLI_PATH, then `opencode`)
        #[arg(long, value_name = "PATH")]
        binary: Option<PathBuf>,
    },

    /// Send one command through a sidecar process and print its data
    Send {
        /// Command name, e.g. `health` or `listSessions`
        #[arg(value_name = "CMD")]
        cmd: String,

        /// Arguments as a JSON object
        #[arg(value_name = "ARGS_JSON")]
        args: Option<String>,

        /// Sidecar binary to spawn (defaults to this executable)
        #[arg(long, value_name = "PATH")]
        sidecar: Option<PathBuf>,
    },
}

/// Overrides for values otherwise read from the environment.
#[derive(clap::Args, Debug, Default, Clone)]
pub struct ServeArgs {
    /// opencode binary to launch
    #[arg(long, value_name = "PATH")]
    pub binary: Option<PathBuf>,

    /// Hostname passed to `opencode serve`
    #[arg(long)]
    pub hostname: Option<String>,

    /// Port passed to `opencode serve` (0 picks a free port)
    #[arg(long)]
    pub port: Option<u16>,

    /// Project directory for the service and downstream calls
    #[arg(long, value_name = "DIR")]
    pub directory: Option<String>,

    /// Milliseconds to wait for the service to report its URL
    #[arg(long, value_name = "MS")]
    pub launch_timeout_ms: Option<u64>,

    /// Skip launching and talk to this URL directly
    #[arg(long, value_name = "URL")]
    pub url: Option<String>,
}
