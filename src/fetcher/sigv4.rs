//! AWS Signature Version 4 for S3-compatible object storage.
//!
//! Only what the object-storage fetcher needs: header-based signing of
//! body-less requests (HEAD / GET) without query parameters.

use chrono::{DateTime, Utc};
use reqwest::Url;
use ring::hmac;
use sha2::{Digest, Sha256};

use super::credentials::Credentials;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "s3";

/// SHA-256 of an empty payload.
pub const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Percent-encode per RFC 3986 as SigV4 requires. `/` is kept when
/// `keep_slash` is set (object key paths).
pub fn uri_encode(input: &str, keep_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b'/' if keep_slash => out.push('/'),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// `host[:port]` exactly as reqwest will send it in the `Host` header.
pub fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    hmac::sign(&key, data).as_ref().to_vec()
}

/// Derive the per-day signing key.
pub fn signing_key(secret: &str, date: &str, region: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{}", secret).as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, SERVICE.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// A request ready to be signed: method, already-encoded path and the
/// headers to sign (names in any case).
pub struct SigningRequest<'a> {
    pub method: &'a str,
    pub canonical_uri: &'a str,
    pub headers: &'a [(String, String)],
    pub payload_sha256: &'a str,
}

impl SigningRequest<'_> {
    /// Sorted `(lowercase-name, trimmed-value)` pairs.
    fn canonical_headers(&self) -> Vec<(String, String)> {
        let mut headers: Vec<(String, String)> = self
            .headers
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.trim().to_string()))
            .collect();
        headers.sort();
        headers
    }

    pub fn signed_headers(&self) -> String {
        self.canonical_headers()
            .into_iter()
            .map(|(k, _)| k)
            .collect::<Vec<_>>()
            .join(";")
    }

    pub fn canonical_request(&self) -> String {
        let headers: String = self
            .canonical_headers()
            .into_iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();
        format!(
            "{}\n{}\n\n{}\n{}\n{}",
            self.method,
            self.canonical_uri,
            headers,
            self.signed_headers(),
            self.payload_sha256
        )
    }

    pub fn string_to_sign(&self, now: DateTime<Utc>, region: &str) -> String {
        format!(
            "{}\n{}\n{}\n{}",
            ALGORITHM,
            now.format("%Y%m%dT%H%M%SZ"),
            scope(now, region),
            sha256_hex(self.canonical_request().as_bytes())
        )
    }

    /// The `Authorization` header value.
    pub fn authorization(&self, creds: &Credentials, region: &str, now: DateTime<Utc>) -> String {
        let date = now.format("%Y%m%d").to_string();
        let key = signing_key(&creds.secret_key, &date, region);
        let signature = hex::encode(hmac_sha256(
            &key,
            self.string_to_sign(now, region).as_bytes(),
        ));
        format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            ALGORITHM,
            creds.access_key,
            scope(now, region),
            self.signed_headers(),
            signature
        )
    }
}

fn scope(now: DateTime<Utc>, region: &str) -> String {
    format!("{}/{}/{}/aws4_request", now.format("%Y%m%d"), region, SERVICE)
}

/// Headers to attach to a body-less S3 request, `Authorization` included.
///
/// `extra` headers (e.g. `If-Match`) are signed along with the mandatory ones.
pub fn sign_headers(
    method: &str,
    url: &Url,
    extra: &[(String, String)],
    creds: &Credentials,
    region: &str,
    now: DateTime<Utc>,
) -> Vec<(String, String)> {
    let mut headers = vec![
        ("host".to_string(), host_header(url)),
        (
            "x-amz-content-sha256".to_string(),
            EMPTY_PAYLOAD_SHA256.to_string(),
        ),
        (
            "x-amz-date".to_string(),
            now.format("%Y%m%dT%H%M%SZ").to_string(),
        ),
    ];
    if let Some(token) = &creds.session_token {
        headers.push(("x-amz-security-token".to_string(), token.clone()));
    }
    headers.extend(extra.iter().cloned());

    let request = SigningRequest {
        method,
        canonical_uri: url.path(),
        headers: &headers,
        payload_sha256: EMPTY_PAYLOAD_SHA256,
    };
    let authorization = request.authorization(creds, region, now);

    // reqwest derives Host from the URL itself.
    headers.retain(|(k, _)| k != "host");
    headers.push(("authorization".to_string(), authorization));
    headers
}
