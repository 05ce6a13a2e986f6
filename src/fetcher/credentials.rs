//! Credential resolution for object storage.
//!
//! Order: configured keys, then the standard AWS environment variables, then
//! the EC2 instance metadata service (IMDSv2). When nothing resolves, requests
//! go out unsigned, which public buckets accept.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::log_component;

const IMDS_ENDPOINT: &str = "http://169.254.169.254";
const IMDS_TIMEOUT: Duration = Duration::from_secs(1);
const IMDS_TOKEN_TTL_SECS: &str = "21600";
/// Refresh instance credentials this long before they expire.
const EXPIRY_MARGIN_SECS: i64 = 300;

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
    pub session_token: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"[redacted]")
            .field("session_token", &self.session_token.as_ref().map(|_| "[redacted]"))
            .finish()
    }
}

impl Credentials {
    /// Both halves present, or nothing.
    fn from_pair(access: String, secret: String, token: Option<String>) -> Option<Self> {
        if access.is_empty() || secret.is_empty() {
            return None;
        }
        Some(Self {
            access_key: access,
            secret_key: secret,
            session_token: token.filter(|t| !t.is_empty()),
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ImdsCredentials {
    access_key_id: String,
    secret_access_key: String,
    token: Option<String>,
    expiration: Option<DateTime<Utc>>,
}

/// Resolves credentials on every request, caching instance-metadata results
/// until shortly before they expire.
pub struct CredentialChain {
    configured: Option<Credentials>,
    imds_endpoint: Option<String>,
    client: reqwest::Client,
    cached: Option<(Credentials, Option<DateTime<Utc>>)>,
}

impl CredentialChain {
    pub fn new(access: &str, secret: &str, token: Option<&str>, use_instance_metadata: bool) -> Self {
        Self {
            configured: Credentials::from_pair(
                access.to_string(),
                secret.to_string(),
                token.map(str::to_string),
            ),
            imds_endpoint: use_instance_metadata.then(|| IMDS_ENDPOINT.to_string()),
            client: reqwest::Client::new(),
            cached: None,
        }
    }

    /// Point instance-metadata lookups at another base URL.
    pub fn with_imds_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.imds_endpoint = Some(endpoint.into());
        self
    }

    pub async fn resolve(&mut self) -> Option<Credentials> {
        self.resolve_with(|key| std::env::var(key).ok()).await
    }

    /// Resolve using `env` as the process environment.
    pub async fn resolve_with<F>(&mut self, env: F) -> Option<Credentials>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(creds) = &self.configured {
            return Some(creds.clone());
        }
        if let Some(creds) = from_env(&env) {
            return Some(creds);
        }

        let endpoint = self.imds_endpoint.clone()?;
        if let Some((creds, expires)) = &self.cached {
            let fresh = expires.map_or(true, |at| {
                Utc::now() + chrono::Duration::seconds(EXPIRY_MARGIN_SECS) < at
            });
            if fresh {
                return Some(creds.clone());
            }
        }
        match self.fetch_instance_credentials(&endpoint).await {
            Ok((creds, expires)) => {
                self.cached = Some((creds.clone(), expires));
                Some(creds)
            }
            Err(e) => {
                // Nothing listens off EC2; stop paying the timeout on every poll.
                let unreachable = e.is_connect() || e.is_timeout();
                if unreachable {
                    self.imds_endpoint = None;
                }
                log_component!(
                    debug,
                    "object_storage",
                    "instance metadata unavailable, sending unsigned requests",
                    error = e.to_string().as_str(),
                    disabled = unreachable
                );
                None
            }
        }
    }

    async fn fetch_instance_credentials(
        &self,
        endpoint: &str,
    ) -> reqwest::Result<(Credentials, Option<DateTime<Utc>>)> {
        let token = self
            .client
            .put(format!("{}/latest/api/token", endpoint))
            .header("X-aws-ec2-metadata-token-ttl-seconds", IMDS_TOKEN_TTL_SECS)
            .timeout(IMDS_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let roles = self
            .client
            .get(format!("{}/latest/meta-data/iam/security-credentials/", endpoint))
            .header("X-aws-ec2-metadata-token", &token)
            .timeout(IMDS_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let role = roles.lines().next().unwrap_or_default().trim().to_string();

        let creds: ImdsCredentials = self
            .client
            .get(format!(
                "{}/latest/meta-data/iam/security-credentials/{}",
                endpoint, role
            ))
            .header("X-aws-ec2-metadata-token", &token)
            .timeout(IMDS_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok((
            Credentials {
                access_key: creds.access_key_id,
                secret_key: creds.secret_access_key,
                session_token: creds.token,
            },
            creds.expiration,
        ))
    }
}

fn from_env<F>(env: &F) -> Option<Credentials>
where
    F: Fn(&str) -> Option<String>,
{
    let access = env("AWS_ACCESS_KEY_ID").or_else(|| env("AWS_ACCESS_KEY"))?;
    let secret = env("AWS_SECRET_ACCESS_KEY").or_else(|| env("AWS_SECRET_KEY"))?;
    Credentials::from_pair(access, secret, env("AWS_SESSION_TOKEN"))
}
