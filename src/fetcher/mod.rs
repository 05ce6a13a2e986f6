//! Source adapters: decide whether a newer binary exists and retrieve it.
//!
//! Every adapter implements [`Fetcher`]: `init` validates configuration once,
//! then `fetch` is awaited back-to-back by a single polling loop. `fetch`
//! owns the polling cadence (see [`Pacer`]) and yields:
//! - `Ok(None)` when the remote artifact is unchanged,
//! - `Ok(Some(stream))` when a new artifact has been retrieved,
//! - `Err(_)` for any transport or protocol failure.
//!
//! Last-observed state only advances after a fully successful retrieval, so a
//! failed poll is retried from scratch on the next one. For a streamed body
//! that means the stream reached a clean end of file. A consumer that cannot
//! use a retrieved artifact calls [`Fetcher::reject`] to have it fetched again.

pub mod credentials;
pub mod http;
pub mod object_storage;
pub mod sigv4;

pub use http::{HttpFetcher, RetrievalMode};
pub use object_storage::ObjectStorageFetcher;

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, ReadBuf};

use crate::config::{FetcherConfig, HttpFetcherConfig};
use crate::error::{PhoenixError, Result};

/// A readable candidate executable, possibly wrapped in transparent decompression.
pub type ArtifactStream = Pin<Box<dyn AsyncRead + Send>>;

/// Produces a fresh authentication header value for each request.
pub type SecretFn = Arc<dyn Fn() -> String + Send + Sync>;

/// Backend-specific implementation of the fetch contract.
#[async_trait]
pub trait Fetcher: Send {
    /// Validate mandatory fields, fill defaults and initialise last-observed state.
    fn init(&mut self) -> Result<()>;

    /// Wait one polling interval (skipped on the first call), then check the
    /// remote artifact and retrieve it if it changed.
    async fn fetch(&mut self) -> Result<Option<ArtifactStream>>;

    /// Forget the artifact returned by the last `fetch`, so the next poll
    /// retrieves it again.
    fn reject(&mut self) {}

    /// Short human-readable description of the source, for logs.
    fn describe(&self) -> String;
}

// ============================================================================
// Pacer
// ============================================================================

/// Sleeps for the polling interval before every fetch except the first.
#[derive(Debug, Clone)]
pub struct Pacer {
    interval: Duration,
    primed: bool,
}

impl Pacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            primed: false,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub(crate) fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    /// Block for the interval unless this is the first call.
    pub async fn wait(&mut self) {
        if self.primed {
            tokio::time::sleep(self.interval).await;
        }
        self.primed = true;
    }
}

// ============================================================================
// End-of-stream tracking
// ============================================================================

/// Wraps an artifact stream and raises a flag once it ends cleanly.
///
/// A read error, or a stream dropped before its end, leaves the flag down.
pub(crate) struct EofSignal {
    inner: ArtifactStream,
    done: Arc<AtomicBool>,
}

impl EofSignal {
    pub(crate) fn new(inner: ArtifactStream) -> (Self, Arc<AtomicBool>) {
        let done = Arc::new(AtomicBool::new(false));
        (
            Self {
                inner,
                done: done.clone(),
            },
            done,
        )
    }
}

impl AsyncRead for EofSignal {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let polled = this.inner.as_mut().poll_read(cx, buf);
        let at_end = buf.filled().len() == before && buf.remaining() > 0;
        if at_end && matches!(polled, Poll::Ready(Ok(()))) {
            this.done.store(true, Ordering::Release);
        }
        polled
    }
}

/// `secs` as a duration, or `default_secs` when zero.
pub(crate) fn secs_or(secs: u64, default_secs: u64) -> Duration {
    Duration::from_secs(if secs == 0 { default_secs } else { secs })
}

// ============================================================================
// Factory
// ============================================================================

/// Build an initialised fetcher from configuration.
pub fn from_config(config: &FetcherConfig) -> Result<Box<dyn Fetcher>> {
    let mut fetcher: Box<dyn Fetcher> = match config {
        FetcherConfig::Http(http) => {
            let mut fetcher = HttpFetcher::new(http.clone());
            if let Some((header, secret)) = secret_from_config(http)? {
                fetcher = fetcher.with_auth(header, secret);
            }
            Box::new(fetcher)
        }
        FetcherConfig::ObjectStorage(storage) => {
            Box::new(ObjectStorageFetcher::new(storage.clone()))
        }
    };
    fetcher.init()?;
    Ok(fetcher)
}

/// Resolve the configured auth header into a value producer.
///
/// The value is re-read on every call so rotated credentials are picked up
/// without a restart.
fn secret_from_config(config: &HttpFetcherConfig) -> Result<Option<(String, SecretFn)>> {
    let Some(header) = config.auth_header.clone().filter(|h| !h.is_empty()) else {
        return Ok(None);
    };

    let secret: SecretFn = match (&config.auth_env, &config.auth_file) {
        (Some(var), None) => {
            let var = var.clone();
            Arc::new(move || std::env::var(&var).unwrap_or_default())
        }
        (None, Some(path)) => {
            let path = path.clone();
            Arc::new(move || {
                std::fs::read_to_string(&path)
                    .map(|s| s.trim().to_string())
                    .unwrap_or_default()
            })
        }
        (Some(_), Some(_)) => {
            return Err(PhoenixError::Config(
                "auth_env and auth_file are mutually exclusive".into(),
            ))
        }
        (None, None) => {
            return Err(PhoenixError::Config(format!(
                "auth header '{}' needs auth_env or auth_file",
                header
            )))
        }
    };
    Ok(Some((header, secret)))
}

// ============================================================================
// Mock fetcher
// ============================================================================

/// Scripted fetcher for driver tests.
#[cfg(test)]
pub struct MockFetcher {
    pub results: std::collections::VecDeque<Result<Option<Vec<u8>>>>,
    pub calls: usize,
    pub rejected: Arc<std::sync::atomic::AtomicUsize>,
}

#[cfg(test)]
impl MockFetcher {
    pub fn new(results: Vec<Result<Option<Vec<u8>>>>) -> Self {
        Self {
            results: results.into(),
            calls: 0,
            rejected: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl Fetcher for MockFetcher {
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    async fn fetch(&mut self) -> Result<Option<ArtifactStream>> {
        self.calls += 1;
        match self.results.pop_front() {
            Some(Ok(Some(bytes))) => Ok(Some(Box::pin(std::io::Cursor::new(bytes)))),
            Some(Ok(None)) | None => Ok(None),
            Some(Err(e)) => Err(e),
        }
    }

    fn reject(&mut self) {
        self.rejected.fetch_add(1, Ordering::SeqCst);
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}
