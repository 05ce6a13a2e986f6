//! Configuration management for Phoenix
//!
//! Configuration is loaded from `~/.phoenix/config.json` (or an explicit path)
//! with environment variable overrides of the form `PHOENIX_SECTION_KEY`.

mod types;

pub use types::*;

use std::path::{Path, PathBuf};

use crate::error::Result;

impl Config {
    /// Returns the Phoenix configuration directory path (~/.phoenix)
    pub fn dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".phoenix")
    }

    /// Returns the path to the config file (~/.phoenix/config.json)
    pub fn path() -> PathBuf {
        Self::dir().join("config.json")
    }

    /// Load configuration from the default path with environment overrides.
    ///
    /// If the config file doesn't exist, returns default configuration.
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::path())
    }

    /// Load configuration from a specific path with environment overrides.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content)?
        } else {
            Config::default()
        };

        config.apply_env_overrides();

        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply `PHOENIX_*` overrides using `lookup` as the environment.
    fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        // Fetcher
        match self.fetcher.as_mut() {
            Some(FetcherConfig::Http(http)) => {
                if let Some(val) = lookup("PHOENIX_FETCHER_URL") {
                    http.url = val;
                }
                if let Some(v) = lookup("PHOENIX_FETCHER_INTERVAL_SECS").and_then(|v| v.parse().ok())
                {
                    http.interval_secs = v;
                }
            }
            Some(FetcherConfig::ObjectStorage(storage)) => {
                if let Some(val) = lookup("PHOENIX_FETCHER_ENDPOINT") {
                    storage.endpoint = val;
                }
                if let Some(v) = lookup("PHOENIX_FETCHER_INTERVAL_SECS").and_then(|v| v.parse().ok())
                {
                    storage.interval_secs = v;
                }
                if let Some(val) = lookup("PHOENIX_FETCHER_ACCESS_KEY") {
                    storage.access_key = val;
                }
                if let Some(val) = lookup("PHOENIX_FETCHER_SECRET_KEY") {
                    storage.secret_key = val;
                }
            }
            None => {
                // A bare URL is enough to poll over HTTP.
                if let Some(url) = lookup("PHOENIX_FETCHER_URL") {
                    self.fetcher = Some(FetcherConfig::Http(HttpFetcherConfig {
                        url,
                        interval_secs: lookup("PHOENIX_FETCHER_INTERVAL_SECS")
                            .and_then(|v| v.parse().ok())
                            .unwrap_or(0),
                        ..Default::default()
                    }));
                }
            }
        }

        // Updater
        if let Some(val) = lookup("PHOENIX_UPDATER_TARGET") {
            self.updater.target = Some(PathBuf::from(val));
        }
        if let Some(v) = lookup("PHOENIX_UPDATER_SANITY_CHECK").and_then(|v| v.parse().ok()) {
            self.updater.sanity_check = v;
        }

        // Watchdog
        if let Some(v) = lookup("PHOENIX_WATCHDOG_PERIOD_MS").and_then(|v| v.parse().ok()) {
            self.watchdog.period_ms = v;
        }

        // Logging
        if let Some(val) = lookup("PHOENIX_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Some(v) = lookup("PHOENIX_LOG_FORMAT").and_then(|v| v.parse().ok()) {
            self.logging.format = v;
        }
    }
}
