//! Error types for the session teardown service.
//!
//! Each collaborator gets its own error enum so callers can match on the kind of
//! failure instead of inspecting message text.

use thiserror::Error;

/// Failures from the container runtime (Kubernetes).
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The pod does not exist. Terminal success for deletion, fatal for lookups.
    #[error("pod `{name}` in namespace `{namespace}` not found")]
    NotFound { namespace: String, name: String },

    /// The service account may not act on the pod. Never retried.
    #[error("forbidden to {action} pod `{name}` in namespace `{namespace}`")]
    Forbidden {
        action: &'static str,
        namespace: String,
        name: String,
    },

    /// Timeouts, connection resets, throttling and server-side errors.
    #[error("transient runtime failure: {0}")]
    Transient(String),

    /// Anything else the runtime rejected.
    #[error("runtime failure: {0}")]
    Fatal(String),
}

impl RuntimeError {
    /// Classify a kube client error for an action on a named pod.
    #[must_use]
    pub fn from_kube(err: kube::Error, action: &'static str, namespace: &str, name: &str) -> Self {
        match err {
            kube::Error::Api(response) => match response.code {
                404 => Self::NotFound {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                },
                403 => Self::Forbidden {
                    action,
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                },
                408 | 429 | 500..=599 => Self::Transient(response.message),
                _ => Self::Fatal(format!("{} ({})", response.message, response.code)),
            },
            kube::Error::SerdeError(e) => Self::Fatal(e.to_string()),
            other => Self::Transient(other.to_string()),
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Failures of a single outbound HTTP call.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Transport-level failure (connect, timeout, reset, TLS).
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("{url} returned HTTP {status}")]
    Status { status: u16, url: String },

    /// The body could not be decoded.
    #[error("failed to decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Failures uploading to the artifact store.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact upload failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("artifact store rejected `{key}` with HTTP {status}")]
    Rejected { key: String, status: u16 },

    #[error("artifact store not configured: {0}")]
    NotConfigured(String),

    #[error("could not sign artifact upload: {0}")]
    Signing(String),
}

/// Failures of the capture-job queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored job could not be read back.
    #[error("corrupt job `{id}`: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("queue is closed")]
    Closed,
}

/// Failure reported by a queue handler; the delivery is left for redelivery.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("pod deletion failed: {0}")]
    Deletion(#[source] RuntimeError),

    #[error("{0}")]
    Other(String),
}

/// Invalid or missing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    Missing(&'static str),

    #[error("environment variable {name} has invalid value `{value}`")]
    Invalid { name: &'static str, value: String },

    #[error("QUEUE_LEASE_SECS is {lease_secs}s but one gated call can take {minimum_secs}s")]
    LeaseTooShort { lease_secs: u64, minimum_secs: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("status {code}"),
            reason: String::new(),
            code,
        })
    }

    #[test]
    fn test_kube_error_classification() {
        assert!(RuntimeError::from_kube(api_error(404), "get", "org", "p1").is_not_found());
        assert!(matches!(
            RuntimeError::from_kube(api_error(403), "delete", "org", "p1"),
            RuntimeError::Forbidden { action: "delete", .. }
        ));
        assert!(matches!(
            RuntimeError::from_kube(api_error(503), "get", "org", "p1"),
            RuntimeError::Transient(_)
        ));
        assert!(matches!(
            RuntimeError::from_kube(api_error(429), "get", "org", "p1"),
            RuntimeError::Transient(_)
        ));
        assert!(matches!(
            RuntimeError::from_kube(api_error(422), "get", "org", "p1"),
            RuntimeError::Fatal(_)
        ));
    }

    #[test]
    fn test_not_found_message_names_pod() {
        let err = RuntimeError::from_kube(api_error(404), "get", "org", "chrome-1");
        assert_eq!(err.to_string(), "pod `chrome-1` in namespace `org` not found");
    }
}
