//! sigmet_raw: read Sigmet raw product volumes through a caching daemon.

mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use sigmet_raw::config::{Config, LogFormat};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "sigmet_raw")]
#[command(about = "Decode Sigmet raw product volumes through a caching daemon")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Daemon working directory
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the daemon
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },

    /// Run a command with a daemon that lives as long as the command
    Start {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Send any other subcommand (types, read, data, ...) to the daemon
    #[command(external_subcommand)]
    Forward(Vec<String>),
}

#[derive(Subcommand, Debug)]
pub enum DaemonAction {
    /// Start the daemon
    Start {
        /// Stay attached to the terminal
        #[arg(long)]
        foreground: bool,
    },
    /// Stop the daemon
    Stop,
    /// Show daemon status
    Status,
}

/// `--config`, else the per-user config file if present, else defaults
fn load_config(cli: &Cli) -> Result<Config> {
    let path = cli.config.clone().or_else(|| {
        directories::ProjectDirs::from("", "", "sigmet_raw")
            .map(|d| d.config_dir().join("config.toml"))
            .filter(|p| p.exists())
    });
    let mut config = match path {
        Some(path) => Config::load(&path)?,
        None => Config::default(),
    };
    if let Some(dir) = &cli.dir {
        config.daemon.dir = dir.clone();
    }
    config.validate()?;
    Ok(config)
}

fn init_logging(config: &Config, verbose: u8) -> Result<()> {
    let level = config.logging.level.raised_by(verbose).to_tracing();
    match config.logging.format {
        LogFormat::Text => {
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .with_target(false)
                .with_writer(std::io::stderr)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        LogFormat::Json => {
            let subscriber = FmtSubscriber::builder()
                .json()
                .with_max_level(level)
                .with_target(false)
                .with_writer(std::io::stderr)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }
    Ok(())
}

fn exit_code(status: i32) -> ExitCode {
    ExitCode::from(u8::try_from(status).unwrap_or(1))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_logging(&config, cli.verbose)?;

    match cli.command {
        Commands::Daemon { action } => {
            commands::handle_daemon(config, cli.config.as_deref(), action).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Start { command } => {
            let status = commands::run_with_daemon(config, command).await?;
            Ok(exit_code(status))
        }
        Commands::Forward(args) => {
            let status = commands::forward(&config, args).await?;
            Ok(exit_code(status))
        }
    }
}
