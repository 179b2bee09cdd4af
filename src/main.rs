use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use shipwright::config::{DEFAULT_CONFIG_PATH, ShipwrightConfig};
use shipwright::logging::{self, LogFormat};

mod cmd;

#[derive(Parser)]
#[command(name = "shipwright")]
#[command(version, about = "LLM feature pipeline: brief to spec, plan, tests, code and review")]
pub struct Cli {
    /// Path to shipwright.toml
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Log output format on stderr
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Compact)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the API, the step consumer pool and the stuck-job sweep
    Serve {
        /// Override server.host
        #[arg(long)]
        host: Option<String>,
        /// Override server.port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run one stuck-job sweep pass and print the report
    Sweep,
    /// Create the config file, database and artifact directory
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Store a provider API key for an owner
    SetSecret {
        owner: String,
        value: String,
        /// Secret name (defaults to provider.secret_name)
        #[arg(long)]
        name: Option<String>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _ = dotenvy::dotenv();
    logging::init(cli.log_format);

    let mut config = ShipwrightConfig::load_or_default(&cli.config)?.with_env()?;

    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            cmd::cmd_serve(&config).await?;
        }
        Commands::Sweep => cmd::cmd_sweep(&config).await?,
        Commands::Init { force } => cmd::cmd_init(&cli.config, &config, force)?,
        Commands::SetSecret { owner, value, name } => {
            cmd::cmd_set_secret(&config, &owner, &value, name.as_deref()).await?
        }
        Commands::Config { command } => cmd::cmd_config(&cli.config, &config, command)?,
    }

    Ok(())
}
