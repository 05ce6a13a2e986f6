//! Object-storage fetcher: polls an S3-compatible bucket/key.
//!
//! A signed `HEAD` (stat) yields the object's ETag and size. An unchanged ETag
//! short-circuits the poll; otherwise the object is downloaded, exactly `size`
//! bytes are read into memory, and only then is the new ETag committed.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use md5::{Digest, Md5};
use reqwest::header::{CONTENT_LENGTH, ETAG};
use reqwest::{Method, RequestBuilder, Url};

use super::credentials::CredentialChain;
use super::sigv4::{sign_headers, uri_encode};
use super::{secs_or, ArtifactStream, Fetcher, Pacer};
use crate::config::{
    ObjectStorageConfig, DEFAULT_GET_TIMEOUT_SECS, DEFAULT_HEAD_TIMEOUT_SECS,
    DEFAULT_INTERVAL_SECS, DEFAULT_REGION,
};
use crate::error::{PhoenixError, Result};
use crate::log_component;

/// Upper bound on the up-front buffer reservation; larger objects grow it.
const MAX_PREALLOC: usize = 64 * 1024 * 1024;

/// Metadata returned by the stat call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStat {
    pub etag: String,
    pub size: u64,
}

/// Lowercase hex MD5 of a file, the ETag S3 assigns to single-part uploads.
pub fn file_md5(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Md5::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Polling S3-compatible source adapter.
pub struct ObjectStorageFetcher {
    config: ObjectStorageConfig,
    client: reqwest::Client,
    credentials: CredentialChain,
    object_url: Option<Url>,
    region: String,
    head_timeout: Duration,
    get_timeout: Duration,
    pacer: Pacer,
    last_etag: String,
    /// ETag in force before the last handed-out artifact, for `reject`.
    prior_etag: Option<String>,
    initialized: bool,
}

impl ObjectStorageFetcher {
    pub fn new(config: ObjectStorageConfig) -> Self {
        let credentials = CredentialChain::new(
            &config.access_key,
            &config.secret_key,
            config.session_token.as_deref(),
            config.use_instance_metadata,
        );
        Self {
            config,
            client: reqwest::Client::new(),
            credentials,
            object_url: None,
            region: DEFAULT_REGION.to_string(),
            head_timeout: Duration::from_secs(DEFAULT_HEAD_TIMEOUT_SECS),
            get_timeout: Duration::from_secs(DEFAULT_GET_TIMEOUT_SECS),
            pacer: Pacer::new(Duration::from_secs(DEFAULT_INTERVAL_SECS)),
            last_etag: String::new(),
            prior_etag: None,
            initialized: false,
        }
    }

    /// Replace the credential chain (e.g. to point IMDS elsewhere).
    pub fn with_credentials(mut self, credentials: CredentialChain) -> Self {
        self.credentials = credentials;
        self
    }

    /// ETag of the last successfully retrieved object (or the seed).
    pub fn last_etag(&self) -> &str {
        &self.last_etag
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn object_url(&self) -> Option<&Url> {
        self.object_url.as_ref()
    }

    pub fn interval(&self) -> Duration {
        self.pacer.interval()
    }

    fn seed_path(&self) -> Option<PathBuf> {
        self.config
            .seed_from
            .clone()
            .or_else(|| std::env::current_exe().ok())
    }

    async fn signed(
        &mut self,
        method: Method,
        url: &Url,
        extra: Vec<(String, String)>,
    ) -> RequestBuilder {
        let mut builder = self.client.request(method.clone(), url.clone());
        let headers = match self.credentials.resolve().await {
            Some(creds) => sign_headers(
                method.as_str(),
                url,
                &extra,
                &creds,
                &self.region,
                chrono::Utc::now(),
            ),
            None => extra,
        };
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        builder
    }

    /// Metadata-only stat of the configured object. Any failure, including a
    /// missing object, is an error.
    pub async fn stat(&mut self) -> Result<ObjectStat> {
        let url = self.ready_url()?;
        let response = self
            .signed(Method::HEAD, &url, Vec::new())
            .await
            .timeout(self.head_timeout)
            .send()
            .await
            .map_err(|e| PhoenixError::probe(format!("stat object failed ({})", e)))?;
        if !response.status().is_success() {
            return Err(PhoenixError::probe(format!(
                "stat object failed (status code {})",
                response.status().as_u16()
            )));
        }

        let headers = response.headers();
        let etag = headers
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().trim_matches('"').to_string())
            .unwrap_or_default();
        let size = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| PhoenixError::probe("stat response lacks a valid Content-Length"))?;
        Ok(ObjectStat { etag, size })
    }

    /// Download the object and read exactly `stat.size` bytes.
    async fn retrieve(&mut self, stat: &ObjectStat) -> Result<Vec<u8>> {
        let url = self.ready_url()?;
        let mut extra = Vec::new();
        if !stat.etag.is_empty() {
            extra.push(("if-match".to_string(), format!("\"{}\"", stat.etag)));
        }
        let mut response = self
            .signed(Method::GET, &url, extra)
            .await
            .timeout(self.get_timeout)
            .send()
            .await
            .map_err(|e| PhoenixError::retrieval(format!("get object failed ({})", e)))?;
        if !response.status().is_success() {
            return Err(PhoenixError::retrieval(format!(
                "get object failed (status code {})",
                response.status().as_u16()
            )));
        }

        let expected = usize::try_from(stat.size).map_err(|_| {
            PhoenixError::retrieval(format!("object of {} bytes does not fit in memory", stat.size))
        })?;
        let mut buffer = Vec::with_capacity(expected.min(MAX_PREALLOC));
        while buffer.len() < expected {
            let chunk = response
                .chunk()
                .await
                .map_err(|e| PhoenixError::retrieval(format!("get object failed ({})", e)))?;
            let Some(chunk) = chunk else {
                break;
            };
            let take = chunk.len().min(expected - buffer.len());
            buffer.extend_from_slice(&chunk[..take]);
        }

        if buffer.len() != expected {
            return Err(PhoenixError::SizeMismatch {
                expected: stat.size,
                received: buffer.len() as u64,
            });
        }
        Ok(buffer)
    }

    fn ready_url(&self) -> Result<Url> {
        self.object_url
            .clone()
            .ok_or_else(|| PhoenixError::Config("object storage fetcher used before init".into()))
    }
}

#[async_trait]
impl Fetcher for ObjectStorageFetcher {
    fn init(&mut self) -> Result<()> {
        if self.config.bucket.is_empty() {
            return Err(PhoenixError::Config("S3 bucket not set".into()));
        }
        if self.config.key.is_empty() {
            return Err(PhoenixError::Config("S3 key not set".into()));
        }

        self.region = if self.config.region.is_empty() {
            DEFAULT_REGION.to_string()
        } else {
            self.config.region.clone()
        };
        let endpoint = if self.config.endpoint.is_empty() {
            format!("s3.{}.amazonaws.com", self.region)
        } else {
            self.config.endpoint.trim_end_matches('/').to_string()
        };
        let scheme = if self.config.use_ssl { "https" } else { "http" };
        let raw = format!(
            "{}://{}/{}/{}",
            scheme,
            endpoint,
            uri_encode(&self.config.bucket, false),
            uri_encode(self.config.key.trim_start_matches('/'), true)
        );
        let url = Url::parse(&raw)
            .map_err(|e| PhoenixError::Config(format!("invalid object URL '{}': {}", raw, e)))?;
        self.object_url = Some(url);

        // A restart against an unchanged object must not re-fetch itself.
        if let Some(path) = self.seed_path() {
            match file_md5(&path) {
                Ok(digest) => self.last_etag = digest,
                Err(e) => log_component!(
                    debug,
                    "object_storage",
                    "could not hash seed executable",
                    path = path.display().to_string().as_str(),
                    error = e.to_string().as_str()
                ),
            }
        }

        self.pacer
            .set_interval(secs_or(self.config.interval_secs, DEFAULT_INTERVAL_SECS));
        self.head_timeout = secs_or(self.config.head_timeout_secs, DEFAULT_HEAD_TIMEOUT_SECS);
        self.get_timeout = secs_or(self.config.get_timeout_secs, DEFAULT_GET_TIMEOUT_SECS);
        self.initialized = true;
        Ok(())
    }

    async fn fetch(&mut self) -> Result<Option<ArtifactStream>> {
        if !self.initialized {
            return Err(PhoenixError::Config(
                "object storage fetcher used before init".into(),
            ));
        }
        self.prior_etag = None;
        self.pacer.wait().await;

        let stat = self.stat().await?;
        if stat.etag == self.last_etag {
            log_component!(
                debug,
                "object_storage",
                "etag unchanged, skipping download",
                etag = stat.etag.as_str()
            );
            return Ok(None);
        }

        let bytes = self.retrieve(&stat).await?;
        self.prior_etag = Some(std::mem::replace(&mut self.last_etag, stat.etag));
        log_component!(
            info,
            "object_storage",
            "new artifact available",
            etag = self.last_etag.as_str(),
            size = stat.size
        );
        Ok(Some(Box::pin(Cursor::new(bytes))))
    }

    fn reject(&mut self) {
        if let Some(prior) = self.prior_etag.take() {
            self.last_etag = prior;
        }
    }

    fn describe(&self) -> String {
        format!("object storage {}/{}", self.config.bucket, self.config.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ObjectStorageConfig {
        ObjectStorageConfig {
            bucket: "releases".into(),
            key: "bin/app".into(),
            use_instance_metadata: false,
            seed_from: Some(PathBuf::from("/nonexistent/phoenix-seed")),
            ..Default::default()
        }
    }

    #[test]
    fn test_init_requires_bucket() {
        let mut fetcher = ObjectStorageFetcher::new(ObjectStorageConfig {
            bucket: String::new(),
            ..config()
        });
        let err = fetcher.init().unwrap_err();
        assert_eq!(err.to_string(), "Configuration error: S3 bucket not set");
    }

    #[test]
    fn test_init_requires_key() {
        let mut fetcher = ObjectStorageFetcher::new(ObjectStorageConfig {
            key: String::new(),
            ..config()
        });
        let err = fetcher.init().unwrap_err();
        assert_eq!(err.to_string(), "Configuration error: S3 key not set");
    }

    #[test]
    fn test_init_defaults() {
        let mut fetcher = ObjectStorageFetcher::new(config());
        fetcher.init().unwrap();
        assert_eq!(fetcher.region(), "ap-southeast-2");
        assert_eq!(fetcher.interval(), Duration::from_secs(300));
        assert_eq!(
            fetcher.object_url().unwrap().as_str(),
            "https://s3.ap-southeast-2.amazonaws.com/releases/bin/app"
        );
        assert_eq!(fetcher.last_etag(), "");
    }

    #[test]
    fn test_init_custom_endpoint_without_ssl() {
        let mut fetcher = ObjectStorageFetcher::new(ObjectStorageConfig {
            endpoint: "minio.local:9000".into(),
            use_ssl: false,
            region: "us-east-1".into(),
            key: "/nightly/app v2".into(),
            ..config()
        });
        fetcher.init().unwrap();
        assert_eq!(fetcher.region(), "us-east-1");
        assert_eq!(
            fetcher.object_url().unwrap().as_str(),
            "http://minio.local:9000/releases/nightly/app%20v2"
        );
    }

    #[test]
    fn test_init_seeds_etag_from_executable_md5() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("app");
        std::fs::write(&exe, b"hello").unwrap();
        let mut fetcher = ObjectStorageFetcher::new(ObjectStorageConfig {
            seed_from: Some(exe),
            ..config()
        });
        fetcher.init().unwrap();
        assert_eq!(fetcher.last_etag(), "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn test_file_md5_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        std::fs::write(&path, b"").unwrap();
        assert_eq!(
            file_md5(&path).unwrap(),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
    }

    #[tokio::test]
    async fn test_fetch_before_init_is_config_error() {
        let mut fetcher = ObjectStorageFetcher::new(config());
        assert!(matches!(
            fetcher.fetch().await,
            Err(PhoenixError::Config(_))
        ));
    }
}
