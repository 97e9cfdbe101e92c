use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use conductor::config::{CONFIG_FILE, ConductorToml};
use conductor_common::RunMode;

mod cmd;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about = "Run controller for staged agent pipelines")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the configuration file
    #[arg(long, global = true, default_value = CONFIG_FILE)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the HTTP control API and event streams
    Serve {
        /// Address to bind (overrides [server] host)
        #[arg(long)]
        host: Option<String>,

        /// Port to serve on (overrides [server] port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Enable dev mode (permissive CORS)
        #[arg(long)]
        dev: bool,
    },
    /// Execute a single run in the terminal
    Run {
        /// The user query
        query: String,

        /// Engagement mode: autonomous or interactive
        #[arg(short, long, default_value = "autonomous")]
        mode: RunMode,

        /// Run only these stages (comma-separated); intake always runs first
        #[arg(long)]
        stages: Option<String>,

        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration with credentials masked
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default configuration file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if let Commands::Config { command } = &cli.command {
        return cmd::cmd_config(&cli.config, command.clone());
    }

    let mut config = ConductorToml::load_or_default(&cli.config)?;
    config.apply_env();
    let _log_guard = conductor::logging::init(&config.logging, cli.verbose)?;

    match cli.command {
        Commands::Serve { host, port, dev } => {
            cmd::cmd_serve(&config, host, port, dev).await?;
        }
        Commands::Run {
            query,
            mode,
            stages,
            json,
        } => {
            cmd::cmd_run(
                &config,
                cmd::run::RunOptions {
                    query,
                    mode,
                    stages,
                    json,
                    verbose: cli.verbose,
                },
            )
            .await?;
        }
        Commands::Config { .. } => {}
    }

    Ok(())
}
