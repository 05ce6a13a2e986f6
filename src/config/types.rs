//! Configuration types for Phoenix.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default polling interval for every fetcher (5 minutes).
pub const DEFAULT_INTERVAL_SECS: u64 = 300;
/// Default timeout for the lightweight metadata probe.
pub const DEFAULT_HEAD_TIMEOUT_SECS: u64 = 5;
/// Default timeout for the full retrieval.
pub const DEFAULT_GET_TIMEOUT_SECS: u64 = 300;
/// Region used when none is configured.
pub const DEFAULT_REGION: &str = "ap-southeast-2";
/// Period between parent liveness probes.
pub const DEFAULT_WATCHDOG_PERIOD_MS: u64 = 2_000;
/// How long a staged binary gets to answer the startup handshake.
pub const DEFAULT_SANITY_TIMEOUT_SECS: u64 = 5;

/// Response headers that, if any change, mean the binary has been updated.
pub const DEFAULT_CHECK_HEADERS: &[&str] =
    &["ETag", "If-Modified-Since", "Last-Modified", "Content-Length"];

// ============================================================================
// Root
// ============================================================================

/// Main configuration struct for Phoenix.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where new binaries come from. `None` disables the fetch loop.
    pub fetcher: Option<FetcherConfig>,
    /// What gets replaced and how a candidate is vetted.
    pub updater: UpdaterConfig,
    /// Parent liveness watchdog.
    pub watchdog: WatchdogConfig,
    /// Logging output.
    pub logging: LoggingConfig,
}

// ============================================================================
// Fetchers
// ============================================================================

/// Source adapter selection, tagged by `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FetcherConfig {
    Http(HttpFetcherConfig),
    ObjectStorage(ObjectStorageConfig),
}

/// Polls a URL with HEAD requests and downloads it with GET when it changes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpFetcherConfig {
    /// URL to poll for new binaries.
    pub url: String,
    /// Seconds between polls. 0 selects the default.
    pub interval_secs: u64,
    /// Response headers compared between polls. `None` selects
    /// [`DEFAULT_CHECK_HEADERS`].
    pub check_headers: Option<Vec<String>>,
    /// Header values already known from a previous run.
    pub initial_header_states: Option<HashMap<String, String>>,
    /// Reuse the HEAD request (with its headers) for the GET.
    pub send_headers_in_get: bool,
    /// Name of the authentication header, if any.
    pub auth_header: Option<String>,
    /// Environment variable holding the auth value, read on every request.
    pub auth_env: Option<String>,
    /// File holding the auth value, read on every request.
    pub auth_file: Option<PathBuf>,
    /// HEAD timeout in seconds. 0 selects the default.
    pub head_timeout_secs: u64,
    /// GET timeout in seconds. 0 selects the default.
    pub get_timeout_secs: u64,
}

/// Polls an S3-compatible bucket/key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectStorageConfig {
    /// `host[:port]` of the storage service. Empty selects AWS for `region`.
    pub endpoint: String,
    /// Access key; falls back to `AWS_ACCESS_KEY_ID`, then instance metadata.
    pub access_key: String,
    /// Secret key; falls back to `AWS_SECRET_ACCESS_KEY`, then instance metadata.
    pub secret_key: String,
    /// Optional session token paired with temporary keys.
    pub session_token: Option<String>,
    /// Signing region. Empty selects [`DEFAULT_REGION`].
    pub region: String,
    pub bucket: String,
    pub key: String,
    pub use_ssl: bool,
    /// Allow the EC2 instance metadata service as a credential source.
    pub use_instance_metadata: bool,
    pub interval_secs: u64,
    pub head_timeout_secs: u64,
    pub get_timeout_secs: u64,
    /// File whose MD5 seeds the initial ETag. `None` hashes the running executable.
    pub seed_from: Option<PathBuf>,
}

impl Default for ObjectStorageConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            access_key: String::new(),
            secret_key: String::new(),
            session_token: None,
            region: String::new(),
            bucket: String::new(),
            key: String::new(),
            use_ssl: true,
            use_instance_metadata: true,
            interval_secs: 0,
            head_timeout_secs: 0,
            get_timeout_secs: 0,
            seed_from: None,
        }
    }
}

// ============================================================================
// Updater
// ============================================================================

/// Fetch loop driver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    /// Executable to replace. `None` targets the running executable.
    pub target: Option<PathBuf>,
    /// Run the staged binary with the handshake env var before installing it.
    pub sanity_check: bool,
    pub sanity_timeout_secs: u64,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            target: None,
            sanity_check: true,
            sanity_timeout_secs: DEFAULT_SANITY_TIMEOUT_SECS,
        }
    }
}

// ============================================================================
// Watchdog
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Milliseconds between parent liveness probes.
    pub period_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            period_ms: DEFAULT_WATCHDOG_PERIOD_MS,
        }
    }
}

// ============================================================================
// Logging
// ============================================================================

/// Output format for tracing events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    #[default]
    Component,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "component" => Ok(LogFormat::Component),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Append JSON lines to this file instead of stderr (json format only).
    pub file: Option<String>,
    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Component,
            file: None,
            level: "info".to_string(),
        }
    }
}
