//! CLI module: command parsing and dispatch
//!
//! All CLI logic lives here. `main.rs` calls `cli::run()`.

pub mod install;
pub mod watch;
pub mod watchdog;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};

use phoenix::config::Config;

#[derive(Parser)]
#[command(name = "phoenix")]
#[command(version)]
#[command(about = "Self-upgrading process supervision", long_about = None)]
struct Cli {
    /// Config file (defaults to ~/.phoenix/config.json)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the configured source and install new builds over the target
    Watch {
        /// Run a single check instead of polling forever
        #[arg(long)]
        once: bool,
    },
    /// Check the configured source once without installing anything
    Check,
    /// Atomically move SRC over DST
    Install {
        /// New file
        src: PathBuf,
        /// File to replace
        dst: PathBuf,
    },
    /// Exit with status 1 as soon as the parent process goes away
    Watchdog {
        /// Milliseconds between liveness probes
        #[arg(long, value_name = "N")]
        period_ms: Option<u64>,
    },
    /// Show version information
    Version,
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from_path(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Config::load().context("failed to load config"),
    }
}

/// Entry point for the CLI, called from main().
pub async fn run() -> Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;
    phoenix::utils::logging::init_logging(&config.logging)?;

    match cli.command {
        None => {
            let mut cmd = Cli::command();
            cmd.print_help()?;
            println!();
        }
        Some(Commands::Version) => {
            println!("phoenix {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Watch { once }) => {
            watch::cmd_watch(&config, once).await?;
        }
        Some(Commands::Check) => {
            watch::cmd_check(&config).await?;
        }
        Some(Commands::Install { src, dst }) => {
            install::cmd_install(&src, &dst)?;
        }
        Some(Commands::Watchdog { period_ms }) => {
            watchdog::cmd_watchdog(&config, period_ms).await?;
        }
    }

    Ok(())
}
