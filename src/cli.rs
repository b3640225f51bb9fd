//! CLI command definitions using clap.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// keel - declarative reconciliation controller
#[derive(Parser, Debug)]
#[command(name = "keel")]
#[command(version)]
#[command(about = "Converge managed workloads to their submitted desired state")]
#[command(
    long_about = "keel reads Deployment-style manifests, diffs them against the observed state of the managed system and applies the minimal ordered set of idempotent actions, retrying transient failures and correcting drift."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the controller against the in-memory cluster until Ctrl+C
    Run {
        /// Manifest files or directories
        #[arg(short, long, required = true, num_args = 1..)]
        manifests: Vec<PathBuf>,

        /// Controller config file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Reconcile worker count (overrides config and KEEL_WORKERS)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Serve the HTTP API on this address
        #[arg(short, long)]
        listen: Option<SocketAddr>,
    },

    /// Print the action plan for each manifest against an empty cluster
    Plan {
        /// Manifest files or directories
        #[arg(short, long, required = true, num_args = 1..)]
        manifests: Vec<PathBuf>,

        /// Emit JSON instead of text
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::panic)]

    use super::*;

    #[test]
    fn run_accepts_several_manifest_paths() {
        let cli = Cli::try_parse_from([
            "keel", "run", "-m", "a.yaml", "manifests/", "--workers", "2", "--listen",
            "127.0.0.1:8080",
        ])
        .unwrap();

        match cli.command {
            Commands::Run {
                manifests,
                workers,
                listen,
                config,
            } => {
                assert_eq!(manifests.len(), 2);
                assert_eq!(workers, Some(2));
                assert_eq!(listen.map(|a| a.port()), Some(8080));
                assert!(config.is_none());
            }
            Commands::Plan { .. } => panic!("expected run"),
        }
    }

    #[test]
    fn manifests_are_required() {
        assert!(Cli::try_parse_from(["keel", "plan"]).is_err());
    }

    #[test]
    fn plan_json_flag() {
        let cli = Cli::try_parse_from(["keel", "plan", "-m", "web.yaml", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::Plan { json: true, .. }));
    }
}
