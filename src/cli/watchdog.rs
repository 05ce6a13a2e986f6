//! Watchdog command: foreground parent liveness watchdog.

use std::time::Duration;

use anyhow::{Context, Result};

use phoenix::config::Config;
use phoenix::Watchdog;

pub(crate) async fn cmd_watchdog(config: &Config, period_ms: Option<u64>) -> Result<()> {
    let period = Duration::from_millis(period_ms.unwrap_or(config.watchdog.period_ms));
    let dog = Watchdog::parent(period).context("failed to start watchdog")?;

    tracing::info!(pid = dog.pid(), "watching parent process");

    // Only returns if the loss action does; the default one exits the process.
    let handle = dog.spawn()?;
    tokio::task::spawn_blocking(move || handle.join())
        .await?
        .map_err(|_| anyhow::anyhow!("watchdog thread panicked"))?;
    Ok(())
}
