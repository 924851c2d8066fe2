// ABOUTME: Entry point for the rollout CLI application.
// ABOUTME: Parses arguments and dispatches to appropriate command handlers.

mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};
use rollout::config::{self, Config};
use rollout::error::Result;
use rollout::output::{Output, OutputMode};
use std::env;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let output = Output::new(OutputMode::from_flags(cli.quiet, cli.json));

    if let Err(e) = run(cli.command, output.clone()).await {
        output.error(&e.to_string());
        std::process::exit(1);
    }
}

/// Load the config from the working directory, narrowed to `destination` if given.
fn load_config(destination: Option<&str>) -> Result<Config> {
    let cwd = env::current_dir()?;
    let config = Config::discover(&cwd)?;
    match destination {
        Some(dest) => config.for_destination(dest),
        None => Ok(config),
    }
}

async fn run(command: Commands, output: Output) -> Result<()> {
    match command {
        Commands::Init {
            service,
            image,
            force,
        } => {
            let cwd = env::current_dir()?;
            config::init_config(&cwd, service.as_deref(), image.as_deref(), force)?;
            output.success(&format!("Created {}", config::CONFIG_FILENAME));
            Ok(())
        }
        Commands::Deploy { destination } => {
            commands::deploy(load_config(destination.as_deref())?, output).await
        }
        Commands::Scale {
            replicas,
            destination,
        } => commands::scale(load_config(destination.as_deref())?, replicas, output).await,
        Commands::Rollback { destination } => {
            commands::rollback(load_config(destination.as_deref())?, output).await
        }
        Commands::Remove { destination } => {
            commands::remove(load_config(destination.as_deref())?, output).await
        }
        Commands::Status { destination } => {
            commands::status(load_config(destination.as_deref())?, output).await
        }
        Commands::Health { destination } => {
            commands::health(load_config(destination.as_deref())?, output).await
        }
    }
}
