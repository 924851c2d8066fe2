// ABOUTME: Command-line interface definition using clap derive macros.
// ABOUTME: Defines all subcommands and their arguments.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "rollout")]
#[command(about = "Build and deploy services onto Docker Swarm or Kubernetes")]
#[command(version)]
pub struct Cli {
    /// Show debug logs
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print only final results
    #[arg(short, long, global = true, conflicts_with = "json")]
    pub quiet: bool,

    /// Print JSON lines instead of text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new rollout.yml configuration file
    Init {
        /// Service name
        #[arg(long)]
        service: Option<String>,

        /// Image reference
        #[arg(long)]
        image: Option<String>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Build (when a source is configured) and deploy the service
    Deploy {
        /// Target destination (defined in config)
        #[arg(short, long)]
        destination: Option<String>,
    },

    /// Change the replica count of the last successful deployment
    Scale {
        replicas: u32,

        #[arg(short, long)]
        destination: Option<String>,
    },

    /// Re-apply the deployment before the current one
    Rollback {
        #[arg(short, long)]
        destination: Option<String>,
    },

    /// Delete the service and everything created for it
    Remove {
        #[arg(short, long)]
        destination: Option<String>,
    },

    /// Show the service's last run and live workload state
    Status {
        #[arg(short, long)]
        destination: Option<String>,
    },

    /// Check that the orchestrator control plane is reachable
    Health {
        #[arg(short, long)]
        destination: Option<String>,
    },
}
