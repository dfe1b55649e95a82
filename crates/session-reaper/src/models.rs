//! Domain types shared by the request path and the capture workers.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Message returned when the pod was handed off for teardown.
pub const SESSION_DELETED_SUCCESSFULLY: &str = "Session deleted successfully.";

/// Prefix of every message returned when the session could not be torn down.
pub const SESSION_NOT_DELETED: &str = "Session not deleted.";

// =============================================================================
// Termination request
// =============================================================================

/// Why a session is being ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminationKind {
    /// Client called delete on its own session.
    Explicit,
    /// The timeout monitor reaped an idle session.
    Timeout,
    /// The session was aborted.
    Aborted,
}

impl TerminationKind {
    /// Map the `{delete_type}` path segment. Anything unrecognised is an explicit delete.
    #[must_use]
    pub fn from_delete_type(raw: &str) -> Self {
        match raw {
            "aborted" => Self::Aborted,
            "timeout" => Self::Timeout,
            _ => Self::Explicit,
        }
    }
}

/// Terminal status pushed to the session backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Completed,
    Timeout,
    Aborted,
}

impl SessionStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Timeout => "timeout",
            Self::Aborted => "aborted",
        }
    }
}

impl From<TerminationKind> for SessionStatus {
    fn from(kind: TerminationKind) -> Self {
        derive_status(kind)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status reported for a given termination kind.
#[must_use]
pub fn derive_status(kind: TerminationKind) -> SessionStatus {
    match kind {
        TerminationKind::Aborted => SessionStatus::Aborted,
        TerminationKind::Timeout => SessionStatus::Timeout,
        TerminationKind::Explicit => SessionStatus::Completed,
    }
}

/// Identifier the backend knows the session by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum IdRef {
    /// WebDriver session id (interactive client path).
    Session(String),
    /// Backend request id (timeout monitor path).
    Request(String),
}

impl IdRef {
    /// Path segment used by the backend for this id variant.
    #[must_use]
    pub fn segment(&self) -> &'static str {
        match self {
            Self::Session(_) => "session",
            Self::Request(_) => "request",
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Session(id) | Self::Request(id) => id,
        }
    }
}

impl fmt::Display for IdRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.segment(), self.id())
    }
}

/// Inbound request to tear a session down. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminationRequest {
    pub pod_name: String,
    pub id_ref: IdRef,
    pub kind: TerminationKind,
}

/// Rejected request shapes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("pod name must not be empty")]
    EmptyPodName,

    #[error("{0} id must not be empty")]
    EmptyId(&'static str),
}

impl TerminationRequest {
    pub fn new(
        pod_name: impl Into<String>,
        id_ref: IdRef,
        kind: TerminationKind,
    ) -> Result<Self, RequestError> {
        let pod_name = pod_name.into();
        if pod_name.trim().is_empty() {
            return Err(RequestError::EmptyPodName);
        }
        if id_ref.id().trim().is_empty() {
            return Err(RequestError::EmptyId(id_ref.segment()));
        }
        Ok(Self {
            pod_name,
            id_ref,
            kind,
        })
    }

    /// Request coming from an API client, keyed by WebDriver session id.
    ///
    /// Firefox pods run geckodriver, whose session ids the backend stores without dashes.
    pub fn for_session(
        pod_name: impl Into<String>,
        session_id: &str,
        kind: TerminationKind,
    ) -> Result<Self, RequestError> {
        let pod_name = pod_name.into();
        let session_id = if pod_name.contains("firefox") {
            session_id.replace('-', "")
        } else {
            session_id.to_string()
        };
        Self::new(pod_name, IdRef::Session(session_id), kind)
    }

    /// Request coming from the timeout monitor, keyed by backend request id.
    pub fn for_request(
        pod_name: impl Into<String>,
        request_id: &str,
        kind: TerminationKind,
    ) -> Result<Self, RequestError> {
        Self::new(pod_name, IdRef::Request(request_id.to_string()), kind)
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        derive_status(self.kind)
    }
}

// =============================================================================
// Session metadata and capture jobs
// =============================================================================

/// Capture flags fetched from the session backend.
///
/// An empty value means "capture nothing", which is what the request path falls back
/// to when the backend cannot be reached.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    #[serde(default, deserialize_with = "null_as_false")]
    pub enable_video: bool,

    #[serde(default, deserialize_with = "null_as_false")]
    pub enable_logs: bool,

    /// Object key for the uploaded browser log. Required when `enable_logs` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_name: Option<String>,

    /// Remaining backend fields, carried through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The backend sends `null` for flags it never set.
fn null_as_false<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or(false))
}

/// A pod as resolved from the container runtime. Resolved fresh per request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
    /// Kubernetes sometimes reports a pod without an IP; that is not an error.
    pub ip: Option<String>,
}

/// Work item handed to the capture worker pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureJob {
    pub pod_name: String,
    pub pod_ip: Option<String>,
    #[serde(default)]
    pub metadata: SessionMetadata,
}

// =============================================================================
// Response envelope
// =============================================================================

/// Body of a termination response (`{"value": null}` per the WebDriver delete-session reply).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedValue {
    pub value: Option<()>,
}

/// Standard acknowledgement envelope. The HTTP status is always a success code;
/// `msg` carries the real outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationAck {
    pub status: u16,
    pub data: DeletedValue,
    pub msg: String,
}

impl TerminationAck {
    #[must_use]
    pub fn deleted() -> Self {
        Self {
            status: 200,
            data: DeletedValue::default(),
            msg: SESSION_DELETED_SUCCESSFULLY.to_string(),
        }
    }

    #[must_use]
    pub fn not_deleted(reason: &str) -> Self {
        Self {
            status: 200,
            data: DeletedValue::default(),
            msg: format!("{SESSION_NOT_DELETED} {reason}"),
        }
    }

    /// True when the pod teardown was handed off (or performed) successfully.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.msg == SESSION_DELETED_SUCCESSFULLY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_capture_flags_read_as_disabled() {
        let metadata: SessionMetadata = serde_json::from_value(serde_json::json!({
            "enable_video": null,
            "enable_logs": true,
            "log_name": null,
            "browser": "firefox"
        }))
        .unwrap();

        assert!(!metadata.enable_video);
        assert!(metadata.enable_logs);
        assert_eq!(metadata.log_name, None);
        assert_eq!(metadata.extra["browser"], "firefox");
    }

    #[test]
    fn test_derive_status() {
        assert_eq!(derive_status(TerminationKind::Aborted), SessionStatus::Aborted);
        assert_eq!(derive_status(TerminationKind::Timeout), SessionStatus::Timeout);
        assert_eq!(derive_status(TerminationKind::Explicit), SessionStatus::Completed);
    }

    #[test]
    fn test_delete_type_mapping() {
        assert_eq!(TerminationKind::from_delete_type("aborted"), TerminationKind::Aborted);
        assert_eq!(TerminationKind::from_delete_type("timeout"), TerminationKind::Timeout);
        assert_eq!(TerminationKind::from_delete_type("explicit"), TerminationKind::Explicit);
        assert_eq!(TerminationKind::from_delete_type(""), TerminationKind::Explicit);
        assert_eq!(TerminationKind::from_delete_type("TIMEOUT"), TerminationKind::Explicit);
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(SessionStatus::Completed.to_string(), "completed");
        assert_eq!(
            serde_json::to_value(SessionStatus::Timeout).unwrap(),
            serde_json::json!("timeout")
        );
    }

    #[test]
    fn test_firefox_session_ids_are_undashed() {
        let request =
            TerminationRequest::for_session("firefox-abc", "1a-2b-3c", TerminationKind::Explicit)
                .unwrap();
        assert_eq!(request.id_ref, IdRef::Session("1a2b3c".to_string()));

        let request =
            TerminationRequest::for_session("chrome-abc", "1a-2b-3c", TerminationKind::Explicit)
                .unwrap();
        assert_eq!(request.id_ref, IdRef::Session("1a-2b-3c".to_string()));
    }

    #[test]
    fn test_request_validation() {
        assert_eq!(
            TerminationRequest::for_request("", "r1", TerminationKind::Timeout),
            Err(RequestError::EmptyPodName)
        );
        assert_eq!(
            TerminationRequest::for_request("p1", " ", TerminationKind::Timeout),
            Err(RequestError::EmptyId("request"))
        );
    }

    #[test]
    fn test_metadata_keeps_unknown_fields() {
        let metadata: SessionMetadata = serde_json::from_value(serde_json::json!({
            "enable_video": true,
            "enable_logs": false,
            "browser": "chrome"
        }))
        .unwrap();

        assert!(metadata.enable_video);
        assert!(!metadata.enable_logs);
        assert_eq!(metadata.log_name, None);
        assert_eq!(metadata.extra.get("browser"), Some(&serde_json::json!("chrome")));
    }

    #[test]
    fn test_ack_body_shape() {
        let body = serde_json::to_value(TerminationAck::deleted()).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "status": 200,
                "data": { "value": null },
                "msg": SESSION_DELETED_SUCCESSFULLY
            })
        );

        let ack = TerminationAck::not_deleted("pod missing");
        assert!(!ack.is_deleted());
        assert!(ack.msg.starts_with(SESSION_NOT_DELETED));
    }
}
