//! Object storage for captured browser logs.
//!
//! Uploads are a single path-style `PUT {endpoint}/{bucket}/{key}`. Against S3 the
//! request is signed with AWS Signature Version 4; other stores can take a bearer
//! token or accept anonymous writes.

use crate::error::ArtifactError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Url;
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

const SIGNING_ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "s3";

/// Blob store for capture artifacts.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `bytes` under `key`.
    async fn upload(&self, key: &str, bytes: Vec<u8>) -> Result<(), ArtifactError>;
}

/// Static AWS credentials plus the region requests are signed for.
#[derive(Clone, PartialEq, Eq)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub region: String,
}

impl fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .field("region", &self.region)
            .finish()
    }
}

/// How uploads authenticate.
#[derive(Clone, PartialEq, Eq)]
pub enum ArtifactAuth {
    Anonymous,
    Bearer(String),
    SigV4(AwsCredentials),
}

impl fmt::Debug for ArtifactAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anonymous => f.write_str("Anonymous"),
            Self::Bearer(_) => f.write_str("Bearer(<redacted>)"),
            Self::SigV4(credentials) => f.debug_tuple("SigV4").field(credentials).finish(),
        }
    }
}

/// [`ArtifactStore`] writing objects over HTTP.
#[derive(Debug, Clone)]
pub struct HttpArtifactStore {
    client: reqwest::Client,
    endpoint: String,
    bucket: String,
    auth: ArtifactAuth,
}

impl HttpArtifactStore {
    pub fn new(
        endpoint: impl Into<String>,
        bucket: impl Into<String>,
        auth: ArtifactAuth,
        timeout: Duration,
    ) -> Result<Self, ArtifactError> {
        let endpoint = endpoint.into();
        if auth == ArtifactAuth::Anonymous && endpoint.contains("amazonaws.com") {
            warn!(endpoint = %endpoint, "No AWS credentials configured; S3 will reject log uploads");
        }

        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint,
            bucket: bucket.into(),
            auth,
        })
    }

    /// Object URL with every path segment percent-encoded.
    #[must_use]
    pub fn object_url(&self, key: &str) -> String {
        format!(
            "{}{}",
            self.endpoint.trim_end_matches('/'),
            encode_path(&format!("/{}/{}", self.bucket, key.trim_start_matches('/')))
        )
    }
}

#[async_trait]
impl ArtifactStore for HttpArtifactStore {
    async fn upload(&self, key: &str, bytes: Vec<u8>) -> Result<(), ArtifactError> {
        if self.bucket.is_empty() {
            return Err(ArtifactError::NotConfigured("S3_BUCKET is empty".to_string()));
        }

        let url = self.object_url(key);
        debug!(url = %url, bytes = bytes.len(), "Uploading artifact");

        let mut request = self.client.put(&url).header(CONTENT_TYPE, "text/plain");
        match &self.auth {
            ArtifactAuth::Anonymous => {}
            ArtifactAuth::Bearer(token) => {
                request = request.header(AUTHORIZATION, format!("Bearer {token}"));
            }
            ArtifactAuth::SigV4(credentials) => {
                for (name, value) in sign_put(credentials, &url, &bytes, Utc::now())? {
                    request = request.header(name, value);
                }
            }
        }

        let response = request.body(bytes).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ArtifactError::Rejected {
                key: key.to_string(),
                status: status.as_u16(),
            });
        }

        info!(key = %key, bucket = %self.bucket, "Uploaded artifact");
        Ok(())
    }
}

/// Headers to add to a `PUT` of `body` to `url`, `Authorization` included.
fn sign_put(
    credentials: &AwsCredentials,
    url: &str,
    body: &[u8],
    now: DateTime<Utc>,
) -> Result<Vec<(&'static str, String)>, ArtifactError> {
    let parsed = Url::parse(url).map_err(|e| ArtifactError::Signing(format!("{url}: {e}")))?;
    let host = match (parsed.host_str(), parsed.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => return Err(ArtifactError::Signing(format!("{url}: no host"))),
    };

    let payload_hash = hex::encode(Sha256::digest(body));
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

    let mut signed = vec![
        ("host", host),
        ("x-amz-content-sha256", payload_hash.clone()),
        ("x-amz-date", amz_date.clone()),
    ];
    if let Some(token) = &credentials.session_token {
        signed.push(("x-amz-security-token", token.clone()));
    }

    let authorization = authorization_header(
        credentials,
        "PUT",
        parsed.path(),
        &signed,
        &payload_hash,
        &amz_date,
    )?;

    let mut headers: Vec<(&'static str, String)> =
        signed.into_iter().filter(|(name, _)| *name != "host").collect();
    headers.push(("authorization", authorization));
    Ok(headers)
}

/// SigV4 `Authorization` value for an S3 request without a query string.
///
/// `headers` are the signed headers with lowercase names; `host` must be among them.
pub fn authorization_header(
    credentials: &AwsCredentials,
    method: &str,
    canonical_uri: &str,
    headers: &[(&str, String)],
    payload_hash: &str,
    amz_date: &str,
) -> Result<String, ArtifactError> {
    let mut headers: Vec<(&str, &str)> = headers
        .iter()
        .map(|(name, value)| (*name, value.trim()))
        .collect();
    headers.sort_by_key(|(name, _)| *name);

    let canonical_headers: String = headers
        .iter()
        .map(|(name, value)| format!("{name}:{value}\n"))
        .collect();
    let signed_headers = headers
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(";");

    let canonical_request =
        format!("{method}\n{canonical_uri}\n\n{canonical_headers}\n{signed_headers}\n{payload_hash}");

    let date = amz_date.get(..8).ok_or_else(|| ArtifactError::Signing(format!("bad date {amz_date}")))?;
    let scope = format!("{date}/{}/{SERVICE}/aws4_request", credentials.region);
    let string_to_sign = format!(
        "{SIGNING_ALGORITHM}\n{amz_date}\n{scope}\n{}",
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let secret = format!("AWS4{}", credentials.secret_access_key);
    let key = hmac_sha256(secret.as_bytes(), date)?;
    let key = hmac_sha256(&key, &credentials.region)?;
    let key = hmac_sha256(&key, SERVICE)?;
    let key = hmac_sha256(&key, "aws4_request")?;
    let signature = hex::encode(hmac_sha256(&key, &string_to_sign)?);

    Ok(format!(
        "{SIGNING_ALGORITHM} Credential={}/{scope},SignedHeaders={signed_headers},Signature={signature}",
        credentials.access_key_id
    ))
}

fn hmac_sha256(key: &[u8], data: &str) -> Result<Vec<u8>, ArtifactError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| ArtifactError::Signing(e.to_string()))?;
    mac.update(data.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Percent-encode everything but unreserved characters and `/`.
fn encode_path(path: &str) -> String {
    let mut encoded = String::with_capacity(path.len());
    for byte in path.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'/' => {
                encoded.push(char::from(byte));
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}
