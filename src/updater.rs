//! Fetch loop driver.
//!
//! Owns one [`Fetcher`] and the executable it keeps current. Each cycle polls
//! the fetcher, stages a new artifact next to the target, skips byte-identical
//! artifacts, optionally runs the staged binary through a startup handshake,
//! and only then renames it into place.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::watch;

use crate::config::{Config, FetcherConfig, UpdaterConfig, DEFAULT_SANITY_TIMEOUT_SECS};
use crate::error::{PhoenixError, Result};
use crate::fetcher::{self, ArtifactStream, Fetcher};
use crate::install::{self, StagedArtifact};
use crate::log_component;

/// Environment variable carrying the handshake token to a staged binary.
pub const BIN_CHECK_ENV: &str = "PHOENIX_BIN_CHECK";

/// Program side of the startup handshake.
///
/// When started with [`BIN_CHECK_ENV`] set, print the token and exit 0.
/// Call this before anything else in `main`.
pub fn answer_bin_check() {
    if let Ok(token) = std::env::var(BIN_CHECK_ENV) {
        let mut stdout = std::io::stdout();
        let _ = stdout.write_all(token.as_bytes());
        let _ = stdout.flush();
        std::process::exit(0);
    }
}

/// Result of one [`Updater::check_once`] cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The source reported no change.
    Unchanged,
    /// A new artifact arrived but its bytes equal the installed executable.
    Identical { sha256: String },
    /// The target now holds the new artifact.
    Installed { sha256: String, bytes: u64 },
}

pub struct Updater {
    fetcher: Box<dyn Fetcher>,
    target: PathBuf,
    sanity_timeout: Option<Duration>,
}

impl Updater {
    /// Drive an initialised fetcher against `target`. The sanity check is off
    /// until [`Updater::with_sanity_check`] enables it.
    pub fn new(fetcher: Box<dyn Fetcher>, target: impl Into<PathBuf>) -> Self {
        Self {
            fetcher,
            target: target.into(),
            sanity_timeout: None,
        }
    }

    /// Build the fetcher and resolve the target from configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let fetcher_config = config
            .fetcher
            .as_ref()
            .ok_or_else(|| PhoenixError::Config("no fetcher configured".into()))?;
        let target = resolve_target(&config.updater)?;
        let fetcher = fetcher::from_config(&seeded_from_target(fetcher_config, &target))?;

        let mut updater = Self::new(fetcher, target);
        if config.updater.sanity_check {
            let secs = match config.updater.sanity_timeout_secs {
                0 => DEFAULT_SANITY_TIMEOUT_SECS,
                n => n,
            };
            updater = updater.with_sanity_check(Duration::from_secs(secs));
        }
        Ok(updater)
    }

    /// Require staged binaries to answer the handshake within `timeout`.
    pub fn with_sanity_check(mut self, timeout: Duration) -> Self {
        self.sanity_timeout = Some(timeout);
        self
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn describe(&self) -> String {
        self.fetcher.describe()
    }

    /// Run a single poll-and-install cycle.
    ///
    /// An artifact that cannot be staged, checked or installed is handed back
    /// to the fetcher, so the next cycle retrieves it again.
    pub async fn check_once(&mut self) -> Result<UpdateOutcome> {
        let Some(stream) = self.fetcher.fetch().await? else {
            return Ok(UpdateOutcome::Unchanged);
        };

        let outcome = self.accept(stream).await;
        if outcome.is_err() {
            self.fetcher.reject();
        }
        outcome
    }

    async fn accept(&mut self, stream: ArtifactStream) -> Result<UpdateOutcome> {
        let staged = install::stage(stream, install::parent_dir(&self.target)).await?;
        log_component!(
            debug,
            "updater",
            "artifact staged",
            sha256 = staged.sha256(),
            bytes = staged.bytes()
        );

        if self.installed_sha256().as_deref() == Some(staged.sha256()) {
            return Ok(UpdateOutcome::Identical {
                sha256: staged.sha256().to_string(),
            });
        }

        staged.make_executable()?;
        if let Some(timeout) = self.sanity_timeout {
            sanity_check(&staged, timeout).await?;
        }

        let sha256 = staged.sha256().to_string();
        let bytes = staged.bytes();
        staged.commit(&self.target)?;
        Ok(UpdateOutcome::Installed { sha256, bytes })
    }

    /// Poll until `shutdown` turns true or a non-retryable error occurs.
    ///
    /// `on_installed` is invoked after every successful install; restarting
    /// into the new binary is its job.
    pub async fn run<F>(&mut self, mut shutdown: watch::Receiver<bool>, mut on_installed: F) -> Result<()>
    where
        F: FnMut(&UpdateOutcome) + Send,
    {
        log_component!(
            info,
            "updater",
            "watching for updates",
            source = self.describe().as_str(),
            target = self.target.display().to_string().as_str()
        );

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let result = tokio::select! {
                result = self.check_once() => result,
                _ = shutdown.changed() => return Ok(()),
            };

            match result {
                Ok(UpdateOutcome::Unchanged) => {}
                Ok(UpdateOutcome::Identical { sha256 }) => {
                    log_component!(
                        info,
                        "updater",
                        "artifact matches installed binary",
                        sha256 = sha256.as_str()
                    );
                }
                Ok(outcome @ UpdateOutcome::Installed { .. }) => {
                    if let UpdateOutcome::Installed { sha256, bytes } = &outcome {
                        log_component!(
                            info,
                            "updater",
                            "update installed",
                            sha256 = sha256.as_str(),
                            bytes = *bytes
                        );
                    }
                    on_installed(&outcome);
                }
                Err(e) if e.is_retryable() => {
                    log_component!(warn, "updater", "update check failed", error = e.to_string().as_str());
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn installed_sha256(&self) -> Option<String> {
        install::file_sha256(&self.target).ok()
    }
}

/// Object storage seeds its ETag from the file being kept current unless told
/// otherwise.
fn seeded_from_target(config: &FetcherConfig, target: &Path) -> FetcherConfig {
    let mut config = config.clone();
    if let FetcherConfig::ObjectStorage(storage) = &mut config {
        if storage.seed_from.is_none() {
            storage.seed_from = Some(target.to_path_buf());
        }
    }
    config
}

/// The configured target, or the running executable with symlinks resolved.
pub fn resolve_target(config: &UpdaterConfig) -> Result<PathBuf> {
    if let Some(target) = config.target.as_ref().filter(|p| !p.as_os_str().is_empty()) {
        return Ok(target.clone());
    }
    let exe = std::env::current_exe()?;
    Ok(exe.canonicalize().unwrap_or(exe))
}

/// Execute the staged binary with a fresh token and require it echoed back.
async fn sanity_check(staged: &StagedArtifact, timeout: Duration) -> Result<()> {
    let token = uuid::Uuid::new_v4().to_string();
    let mut child = spawn_check(staged.path(), &token).await?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| PhoenixError::SanityCheck("stdout not captured".into()))?;

    let exchange = async {
        let mut output = String::new();
        stdout.read_to_string(&mut output).await?;
        let status = child.wait().await?;
        Ok::<_, std::io::Error>((output, status))
    };

    let (output, status) = match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(PhoenixError::SanityCheck(format!(
                "no answer within {}s",
                timeout.as_secs_f32()
            )))
        }
    };

    if !status.success() {
        return Err(PhoenixError::SanityCheck(format!("exited with {}", status)));
    }
    if output.trim() != token {
        return Err(PhoenixError::SanityCheck("token mismatch".into()));
    }
    Ok(())
}

async fn spawn_check(path: &Path, token: &str) -> Result<tokio::process::Child> {
    let mut attempts = 0;
    loop {
        let spawned = Command::new(path)
            .env(BIN_CHECK_ENV, token)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();
        match spawned {
            Ok(child) => return Ok(child),
            // A sibling fork may briefly hold a write handle to the fresh file.
            #[cfg(unix)]
            Err(e) if e.raw_os_error() == Some(nix::errno::Errno::ETXTBSY as i32) && attempts < 5 => {
                attempts += 1;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(e) => {
                return Err(PhoenixError::SanityCheck(format!(
                    "cannot execute {}: {}",
                    path.display(),
                    e
                )))
            }
        }
    }
}
