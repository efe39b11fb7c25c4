use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use forge_actions::config::{ActionsConfig, DEFAULT_CONFIG_PATH};
use forge_actions::telemetry;

mod cmd;

#[derive(Parser)]
#[command(name = "forge-actions")]
#[command(version, about = "CI/CD run orchestration and runner task dispatch")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as one JSON object per line
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Path to actions.toml
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the actions server
    Serve {
        /// Port to serve on (overrides actions.toml)
        #[arg(short, long)]
        port: Option<u16>,

        /// Database path (overrides actions.toml)
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Enable dev mode (CORS permissive)
        #[arg(long)]
        dev: bool,
    },
    /// Create or migrate the database without starting the server
    InitDb {
        /// Database path (overrides actions.toml)
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Issue a runner registration token
    RegistrationToken {
        /// Scope the token to an owner
        #[arg(long, conflicts_with = "repo_id")]
        owner_id: Option<i64>,

        /// Scope the token to a repository
        #[arg(long)]
        repo_id: Option<i64>,

        /// Database path (overrides actions.toml)
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Fail stale tasks, cancel abandoned jobs and drop offline runners once
    Sweep {
        /// Database path (overrides actions.toml)
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default actions.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Config subcommands must work on a broken file, so they load it themselves.
    if let Commands::Config { command } = &cli.command {
        return cmd::cmd_config(&cli.config, command.clone());
    }

    let config = ActionsConfig::load(cli.config.clone())?;
    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        telemetry::parse_level(config.log_level())
    };
    telemetry::init_tracing(cli.json_logs || config.json_logs(), level);

    match &cli.command {
        Commands::Serve { port, db_path, dev } => {
            let config = config.with_cli_args(*port, db_path.clone(), cli.json_logs);
            cmd::cmd_serve(&config, *dev).await?;
        }
        Commands::InitDb { db_path } => {
            let config = config.with_cli_args(None, db_path.clone(), cli.json_logs);
            cmd::cmd_init_db(&config)?;
        }
        Commands::RegistrationToken {
            owner_id,
            repo_id,
            db_path,
        } => {
            let config = config.with_cli_args(None, db_path.clone(), cli.json_logs);
            cmd::cmd_registration_token(&config, *owner_id, *repo_id)?;
        }
        Commands::Sweep { db_path } => {
            let config = config.with_cli_args(None, db_path.clone(), cli.json_logs);
            cmd::cmd_sweep(&config).await?;
        }
        Commands::Config { .. } => {}
    }

    Ok(())
}
