//! Watch and check commands: drive the configured fetcher.

use anyhow::{Context, Result};
use tokio::sync::watch;

use phoenix::config::Config;
use phoenix::{fetcher, UpdateOutcome, Updater};

fn describe(outcome: &UpdateOutcome) -> String {
    match outcome {
        UpdateOutcome::Unchanged => "No update available.".to_string(),
        UpdateOutcome::Identical { sha256 } => {
            format!("Source changed but matches the installed binary ({}).", short(sha256))
        }
        UpdateOutcome::Installed { sha256, bytes } => {
            format!("Installed update {} ({} bytes).", short(sha256), bytes)
        }
    }
}

fn short(sha256: &str) -> &str {
    sha256.get(..12).unwrap_or(sha256)
}

pub(crate) async fn cmd_watch(config: &Config, once: bool) -> Result<()> {
    let mut updater = Updater::from_config(config).context("failed to set up updater")?;

    println!("Source: {}", updater.describe());
    println!("Target: {}", updater.target().display());

    if once {
        let outcome = updater.check_once().await?;
        println!("{}", describe(&outcome));
        return Ok(());
    }

    println!();
    println!("Press Ctrl+C to stop.");

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal");
        let _ = tx.send(true);
    });

    updater
        .run(rx, |outcome| {
            println!("{} Restart to run it.", describe(outcome));
        })
        .await?;
    Ok(())
}

pub(crate) async fn cmd_check(config: &Config) -> Result<()> {
    let fetcher_config = config
        .fetcher
        .as_ref()
        .context("no fetcher configured (set `fetcher` in the config file or PHOENIX_FETCHER_URL)")?;
    let mut fetcher = fetcher::from_config(fetcher_config)?;

    println!("Source: {}", fetcher.describe());
    match fetcher.fetch().await? {
        Some(_) => println!("Update available."),
        None => println!("Unchanged."),
    }
    Ok(())
}
