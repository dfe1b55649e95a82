//! Service configuration from environment variables.

use crate::artifacts::{ArtifactAuth, AwsCredentials};
use crate::error::ConfigError;
use crate::queue::PoolSettings;
use crate::retry::RetryPolicy;
use crate::sidecar::DEFAULT_SIDECAR_PORT;
use crate::telemetry::LogFormat;
use crate::worker::DEFAULT_BROWSER_CONTAINER;
use std::str::FromStr;
use std::time::Duration;

/// Which queue implementation backs capture jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBackend {
    /// Durable `ConfigMap` queue shared by all replicas and the standalone worker.
    ConfigMap,
    /// Process-local queue; only embedded workers can drain it.
    Memory,
}

impl FromStr for QueueBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "configmap" => Ok(Self::ConfigMap),
            "memory" => Ok(Self::Memory),
            other => Err(other.to_string()),
        }
    }
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    // HTTP server
    pub host: String,
    pub port: u16,

    // Kubernetes namespace holding the browser pods (one per organization)
    pub org_name: String,

    // Session backend
    pub backend_root_url: String,
    pub http_timeout: Duration,
    pub retry_limit: u32,
    pub retry_pause: Duration,

    // Capture
    pub sidecar_port: u16,
    pub browser_container: String,
    pub artifact_store_url: String,
    pub artifact_store_token: Option<String>,
    pub aws_credentials: Option<AwsCredentials>,
    pub s3_bucket: String,

    // Queue and workers
    pub queue_backend: QueueBackend,
    pub embedded_workers: bool,
    pub worker_concurrency: usize,
    pub queue_lease: Duration,
    pub queue_poll: Duration,
    pub max_deliveries: u32,

    // Logging
    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &'static str| lookup(name).filter(|value| !value.trim().is_empty());
        let required = |name: &'static str| get(name).ok_or(ConfigError::Missing(name));

        let base_url = required("BASE_URL")?;
        let backend_url = required("BACKEND_URL")?;
        let aws_region = get("AWS_REGION").unwrap_or_else(|| "us-east-1".to_string());

        let config = Self {
            host: get("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse(get("PORT"), "PORT", 8080)?,

            org_name: required("ORG_NAME")?,

            backend_root_url: join_url(&base_url, &backend_url),
            http_timeout: Duration::from_secs(parse(get("HTTP_TIMEOUT_SECS"), "HTTP_TIMEOUT_SECS", 10)?),
            retry_limit: parse(get("RETRY_LIMIT"), "RETRY_LIMIT", 6)?,
            retry_pause: Duration::from_secs(parse(get("RETRY_PAUSE_TIME"), "RETRY_PAUSE_TIME", 5)?),

            sidecar_port: parse(get("SIDECAR_PORT"), "SIDECAR_PORT", DEFAULT_SIDECAR_PORT)?,
            browser_container: get("BROWSER_CONTAINER")
                .unwrap_or_else(|| DEFAULT_BROWSER_CONTAINER.to_string()),
            artifact_store_url: get("ARTIFACT_STORE_URL")
                .unwrap_or_else(|| format!("https://s3.{aws_region}.amazonaws.com")),
            artifact_store_token: get("ARTIFACT_STORE_TOKEN"),
            aws_credentials: match (get("AWS_ACCESS_KEY_ID"), get("AWS_SECRET_ACCESS_KEY")) {
                (Some(access_key_id), Some(secret_access_key)) => Some(AwsCredentials {
                    access_key_id,
                    secret_access_key,
                    session_token: get("AWS_SESSION_TOKEN"),
                    region: aws_region,
                }),
                (None, None) => None,
                (Some(_), None) => return Err(ConfigError::Missing("AWS_SECRET_ACCESS_KEY")),
                (None, Some(_)) => return Err(ConfigError::Missing("AWS_ACCESS_KEY_ID")),
            },
            s3_bucket: get("S3_BUCKET").unwrap_or_default(),

            queue_backend: parse(get("QUEUE_BACKEND"), "QUEUE_BACKEND", QueueBackend::ConfigMap)?,
            embedded_workers: parse_bool(get("EMBEDDED_WORKERS"), "EMBEDDED_WORKERS", true)?,
            worker_concurrency: parse(get("WORKER_CONCURRENCY"), "WORKER_CONCURRENCY", 4)?,
            queue_lease: Duration::from_secs(parse(get("QUEUE_LEASE_SECS"), "QUEUE_LEASE_SECS", 300)?),
            queue_poll: Duration::from_millis(parse(get("QUEUE_POLL_MS"), "QUEUE_POLL_MS", 1000)?),
            max_deliveries: parse(get("MAX_DELIVERIES"), "MAX_DELIVERIES", 5)?,

            log_format: parse(get("LOG_FORMAT"), "LOG_FORMAT", LogFormat::Pretty)?,
        };

        let minimum = config.gated_call_budget();
        if config.queue_lease < minimum {
            return Err(ConfigError::LeaseTooShort {
                lease_secs: config.queue_lease.as_secs(),
                minimum_secs: minimum.as_secs(),
            });
        }

        Ok(config)
    }

    /// Retry policy for every gated call.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_limit, self.retry_pause)
    }

    /// How log uploads authenticate: AWS credentials win over a bearer token.
    #[must_use]
    pub fn artifact_auth(&self) -> ArtifactAuth {
        match (&self.aws_credentials, &self.artifact_store_token) {
            (Some(credentials), _) => ArtifactAuth::SigV4(credentials.clone()),
            (None, Some(token)) => ArtifactAuth::Bearer(token.clone()),
            (None, None) => ArtifactAuth::Anonymous,
        }
    }

    /// Worker pool settings.
    #[must_use]
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            concurrency: self.worker_concurrency,
            lease: self.queue_lease,
            poll_interval: self.queue_poll,
            max_deliveries: self.max_deliveries,
        }
    }

    /// Worst case for one gated call: every attempt times out and every pause is taken.
    #[must_use]
    pub fn gated_call_budget(&self) -> Duration {
        let policy = self.retry_policy();
        self.http_timeout * policy.max_attempts.max(1) + policy.worst_case_pause()
    }

    /// Budget for the pod lookup, the metadata fetch and the enqueue.
    #[must_use]
    pub fn handoff_timeout(&self) -> Duration {
        self.gated_call_budget() + Duration::from_secs(30)
    }

    /// Outer bound for one termination request: the hand-off, then the status report.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        self.handoff_timeout() + self.gated_call_budget() + Duration::from_secs(30)
    }

    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse<T: FromStr>(raw: Option<String>, name: &'static str, default: T) -> Result<T, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}

fn parse_bool(raw: Option<String>, name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match raw.as_deref().map(str::trim) {
        None => Ok(default),
        Some(v) if v.eq_ignore_ascii_case("true") || v == "1" => Ok(true),
        Some(v) if v.eq_ignore_ascii_case("false") || v == "0" => Ok(false),
        Some(v) => Err(ConfigError::Invalid {
            name,
            value: v.to_string(),
        }),
    }
}

/// Join two URL parts with exactly one slash between them.
fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}
