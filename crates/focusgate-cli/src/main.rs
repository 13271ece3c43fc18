mod commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use focusgate_core::AgentConfig;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "focusgate")]
#[command(about = "Session-scoped focus enforcement agent", long_about = None)]
struct Cli {
    /// Path to config.toml (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Override the client id
    #[arg(long, global = true)]
    client: Option<String>,
    /// Override the identity matched against push updates
    #[arg(long, global = true)]
    identity: Option<String>,
    /// Append debug-level logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the agent in the foreground until Ctrl-C
    Run,
    /// Probe the monitored tab once and print the decision
    Probe,
    /// List processes of the current session
    Processes {
        /// Include processes that are not monitored
        #[arg(short, long)]
        all: bool,
    },
    /// Unblock all domains and resume all monitored processes
    Release,
    /// Print the effective configuration
    Config,
}

fn load_config(cli: &Cli) -> Result<AgentConfig> {
    let mut config = AgentConfig::load(cli.config.as_deref())?;
    if let Some(client) = &cli.client {
        config.client.clone_from(client);
    }
    if let Some(identity) = &cli.identity {
        config.identity = Some(identity.clone());
    }
    config.validate()?;
    Ok(config)
}

fn setup_file_logging(log_path: &Path) -> Result<()> {
    use std::fs::{create_dir_all, OpenOptions};

    if let Some(parent) = log_path.parent() {
        create_dir_all(parent)?;
    }

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("Failed to open log file {}", log_path.display()))?;

    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(Box::new(log_file)))
        .filter_level(log::LevelFilter::Debug)
        .format_timestamp_secs()
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.log_file {
        Some(path) => setup_file_logging(path)?,
        None => env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .format_timestamp_secs()
            .init(),
    }

    let config = load_config(&cli)?;

    match cli.command {
        Commands::Run => commands::run::run_agent(config).await,
        Commands::Probe => commands::probe::probe_page(&config).await,
        Commands::Processes { all } => commands::processes::list_processes(&config, all).await,
        Commands::Release => commands::release::release(config).await,
        Commands::Config => commands::config::show_config(&config),
    }
}
