//! HTTP fetcher: polls a URL with HEAD and downloads it with GET on change.
//!
//! The HEAD response's watched headers (ETag, Last-Modified, ...) are compared
//! with the values seen at the last successful download. If every watched
//! header present in the response matches, the download is skipped entirely.
//! Header values are committed only once the GET body has been read to a
//! clean end, otherwise a failed download would suppress the next attempt.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_compression::tokio::bufread::GzipDecoder;
use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_ENCODING};
use reqwest::{Method, Request};
use tokio_util::io::StreamReader;

use super::{secs_or, ArtifactStream, EofSignal, Fetcher, Pacer, SecretFn};
use crate::config::{
    HttpFetcherConfig, DEFAULT_CHECK_HEADERS, DEFAULT_GET_TIMEOUT_SECS, DEFAULT_HEAD_TIMEOUT_SECS,
    DEFAULT_INTERVAL_SECS,
};
use crate::error::{PhoenixError, Result};
use crate::log_component;

/// Framing headers that describe a message body and must never be replayed
/// onto a body-less probe.
const NEVER_REPLAY: &[&str] = &["content-length", "transfer-encoding", "host"];

/// How the full retrieval request is built once a change is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalMode {
    /// A new GET carrying only the authentication header.
    Fresh,
    /// The probe request itself with its method switched to GET, keeping the
    /// replayed conditional headers.
    ReuseProbe,
}

/// Result of comparing one probe response against last-observed state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comparison {
    pub matches: usize,
    pub total: usize,
    /// Watched headers present in the response, to commit after a download.
    pub observed: Vec<(String, String)>,
}

impl Comparison {
    /// All present watched headers equal their stored values.
    ///
    /// A response without any watched header compares as `0 == 0`, i.e. unchanged.
    pub fn unchanged(&self) -> bool {
        self.matches == self.total
    }
}

/// Compare the watched headers of `response` against `lasts`.
///
/// Only headers present (and non-empty) in the response are counted, so a
/// header the origin never sends can never block an update.
pub fn compare_headers(
    check_headers: &[String],
    lasts: &HashMap<String, String>,
    response: &HeaderMap,
) -> Comparison {
    let mut comparison = Comparison {
        matches: 0,
        total: 0,
        observed: Vec::new(),
    };
    for header in check_headers {
        let Some(current) = response
            .get(header.as_str())
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
        else {
            continue;
        };
        if lasts.get(header).is_some_and(|last| last == current) {
            comparison.matches += 1;
        }
        comparison.total += 1;
        comparison
            .observed
            .push((header.clone(), current.to_string()));
    }
    comparison
}

/// Header values of a handed-out body, applied once it ends cleanly.
struct PendingState {
    observed: Vec<(String, String)>,
    complete: Arc<AtomicBool>,
}

impl PendingState {
    fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }
}

/// Polling HTTP source adapter.
pub struct HttpFetcher {
    config: HttpFetcherConfig,
    client: reqwest::Client,
    auth: Option<(String, SecretFn)>,
    check_headers: Vec<String>,
    head_timeout: Duration,
    get_timeout: Duration,
    pacer: Pacer,
    lasts: HashMap<String, String>,
    pending: Option<PendingState>,
    initialized: bool,
}

impl HttpFetcher {
    pub fn new(config: HttpFetcherConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            auth: None,
            check_headers: Vec::new(),
            head_timeout: Duration::from_secs(DEFAULT_HEAD_TIMEOUT_SECS),
            get_timeout: Duration::from_secs(DEFAULT_GET_TIMEOUT_SECS),
            pacer: Pacer::new(Duration::from_secs(DEFAULT_INTERVAL_SECS)),
            lasts: HashMap::new(),
            pending: None,
            initialized: false,
        }
    }

    /// Attach `header: secret()` to every request. `secret` runs per request.
    pub fn with_auth(mut self, header: impl Into<String>, secret: SecretFn) -> Self {
        self.auth = Some((header.into(), secret));
        self
    }

    pub fn retrieval_mode(&self) -> RetrievalMode {
        if self.config.send_headers_in_get {
            RetrievalMode::ReuseProbe
        } else {
            RetrievalMode::Fresh
        }
    }

    /// Header values recorded at the last successful download, including one
    /// whose body has just been read to the end.
    pub fn last_observed(&self) -> HashMap<String, String> {
        let mut lasts = self.lasts.clone();
        if let Some(pending) = self.pending.as_ref().filter(|p| p.is_complete()) {
            lasts.extend(pending.observed.iter().cloned());
        }
        lasts
    }

    /// Fold a fully read body's headers into state; drop those of a body that
    /// failed or was abandoned.
    fn settle(&mut self) {
        if let Some(pending) = self.pending.take() {
            if pending.is_complete() {
                self.lasts.extend(pending.observed);
            } else {
                log_component!(
                    debug,
                    "http",
                    "previous download incomplete, keeping old state",
                    url = self.config.url.as_str()
                );
            }
        }
    }

    pub fn interval(&self) -> Duration {
        self.pacer.interval()
    }

    pub fn check_headers(&self) -> &[String] {
        &self.check_headers
    }

    fn auth_header(&self) -> Result<Option<(HeaderName, HeaderValue)>> {
        let Some((name, secret)) = &self.auth else {
            return Ok(None);
        };
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| PhoenixError::Config(format!("invalid auth header '{}': {}", name, e)))?;
        let value = HeaderValue::from_str(&secret())
            .map_err(|e| PhoenixError::probe(format!("invalid auth header value ({})", e)))?;
        Ok(Some((name, value)))
    }

    fn build_probe(&self) -> Result<Request> {
        let mut request = self
            .client
            .request(Method::HEAD, &self.config.url)
            .timeout(self.head_timeout)
            .build()
            .map_err(|e| PhoenixError::probe(format!("HEAD request creation failed ({})", e)))?;

        let headers = request.headers_mut();
        for (name, value) in &self.lasts {
            if NEVER_REPLAY.contains(&name.to_ascii_lowercase().as_str()) {
                continue;
            }
            // Validated in init() or taken from a previous response.
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.append(name, value);
            }
        }
        if let Some((name, value)) = self.auth_header()? {
            headers.append(name, value);
        }
        Ok(request)
    }

    fn build_retrieval(&self, probe: Option<Request>) -> Result<Request> {
        if let Some(mut request) = probe {
            *request.method_mut() = Method::GET;
            *request.timeout_mut() = Some(self.get_timeout);
            return Ok(request);
        }

        let mut request = self
            .client
            .request(Method::GET, &self.config.url)
            .timeout(self.get_timeout)
            .build()
            .map_err(|e| PhoenixError::retrieval(format!("GET request creation failed ({})", e)))?;
        if let Some((name, value)) = self.auth_header()? {
            request.headers_mut().append(name, value);
        }
        Ok(request)
    }

    fn decompress(&self, headers: &HeaderMap) -> bool {
        let transport_gzip = headers
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("gzip"));
        self.config.url.ends_with(".gz") && !transport_gzip
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    fn init(&mut self) -> Result<()> {
        if self.config.url.is_empty() {
            return Err(PhoenixError::Config("URL required".into()));
        }
        reqwest::Url::parse(&self.config.url).map_err(|e| {
            PhoenixError::Config(format!("invalid URL '{}': {}", self.config.url, e))
        })?;

        let lasts = self.config.initial_header_states.clone().unwrap_or_default();
        for (name, value) in &lasts {
            HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| PhoenixError::Config(format!("invalid header '{}': {}", name, e)))?;
            HeaderValue::from_str(value).map_err(|e| {
                PhoenixError::Config(format!("invalid value for header '{}': {}", name, e))
            })?;
        }
        self.lasts = lasts;

        self.pacer
            .set_interval(secs_or(self.config.interval_secs, DEFAULT_INTERVAL_SECS));
        self.head_timeout = secs_or(self.config.head_timeout_secs, DEFAULT_HEAD_TIMEOUT_SECS);
        self.get_timeout = secs_or(self.config.get_timeout_secs, DEFAULT_GET_TIMEOUT_SECS);
        self.check_headers = self.config.check_headers.clone().unwrap_or_else(|| {
            DEFAULT_CHECK_HEADERS
                .iter()
                .map(|h| h.to_string())
                .collect()
        });
        if let Some((name, _)) = &self.auth {
            HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| PhoenixError::Config(format!("invalid auth header '{}': {}", name, e)))?;
        }

        self.initialized = true;
        Ok(())
    }

    async fn fetch(&mut self) -> Result<Option<ArtifactStream>> {
        if !self.initialized {
            return Err(PhoenixError::Config("HTTP fetcher used before init".into()));
        }
        self.settle();
        self.pacer.wait().await;

        let probe = self.build_probe()?;
        let retained = match self.retrieval_mode() {
            RetrievalMode::ReuseProbe => probe.try_clone(),
            RetrievalMode::Fresh => None,
        };

        let head = self
            .client
            .execute(probe)
            .await
            .map_err(|e| PhoenixError::probe(format!("HEAD request failed ({})", e)))?;
        if !head.status().is_success() {
            return Err(PhoenixError::probe(format!(
                "HEAD request failed (status code {})",
                head.status().as_u16()
            )));
        }

        let comparison = compare_headers(&self.check_headers, &self.lasts, head.headers());
        if comparison.unchanged() {
            log_component!(
                debug,
                "http",
                "watched headers unchanged, skipping download",
                url = self.config.url.as_str(),
                matched = comparison.matches
            );
            return Ok(None);
        }

        let get = self.build_retrieval(retained)?;
        let response = self
            .client
            .execute(get)
            .await
            .map_err(|e| PhoenixError::retrieval(format!("GET request failed ({})", e)))?;
        if !response.status().is_success() {
            return Err(PhoenixError::retrieval(format!(
                "GET request failed (status code {})",
                response.status().as_u16()
            )));
        }

        let gunzip = self.decompress(response.headers());
        log_component!(
            info,
            "http",
            "new artifact available",
            url = self.config.url.as_str(),
            gunzip = gunzip
        );

        let body = StreamReader::new(response.bytes_stream().map_err(std::io::Error::other));
        let body: ArtifactStream = if gunzip {
            Box::pin(GzipDecoder::new(body))
        } else {
            Box::pin(body)
        };
        let (body, complete) = EofSignal::new(body);
        self.pending = Some(PendingState {
            observed: comparison.observed,
            complete,
        });
        Ok(Some(Box::pin(body)))
    }

    fn reject(&mut self) {
        self.pending = None;
    }

    fn describe(&self) -> String {
        format!("http {}", self.config.url)
    }
}
