//! Session-management backend client.

use crate::http::{decode_json, ApiCall, ApiClient};
use crate::models::{IdRef, SessionMetadata, SessionStatus};
use crate::retry::{Outcome, RetryGateway};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

/// Operations the teardown path needs from the session backend.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Fetch capture flags for a session.
    async fn fetch_metadata(&self, id_ref: &IdRef) -> Outcome<SessionMetadata>;

    /// Push the terminal status of a session.
    async fn update_status(&self, id_ref: &IdRef, status: SessionStatus) -> Outcome<()>;
}

/// Backend URLs for one session, keyed by session id or request id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEndpoints {
    pub details_url: String,
    pub update_url: String,
}

impl SessionEndpoints {
    #[must_use]
    pub fn new(root_url: &str, id_ref: &IdRef) -> Self {
        let root = root_url.trim_end_matches('/');
        let segment = id_ref.segment();
        let id = id_ref.id();
        Self {
            details_url: format!("{root}/get-session-details/{segment}/{id}"),
            update_url: format!("{root}/update-session-status/{segment}/{id}"),
        }
    }
}

/// `{"data": ..., "msg": ...}` envelope used by the backend.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    data: Option<T>,
    #[serde(default)]
    msg: Option<String>,
}

/// Decode a 2xx details body. The backend answered, so a body that cannot be read
/// means "capture nothing" rather than another attempt.
fn decode_details(id_ref: &IdRef, url: &str, body: &[u8]) -> SessionMetadata {
    match decode_json::<Envelope<SessionMetadata>>(url, body) {
        Ok(envelope) => {
            if let Some(msg) = &envelope.msg {
                debug!(session = %id_ref, msg = %msg, "Backend returned session details");
            }
            envelope.data.unwrap_or_default()
        }
        Err(e) => {
            warn!(session = %id_ref, error = %e, "Unreadable session details, capture disabled");
            SessionMetadata::default()
        }
    }
}

/// [`SessionBackend`] over the backend's REST API, with every call gated.
#[derive(Debug, Clone)]
pub struct HttpSessionBackend {
    api: ApiClient,
    gateway: RetryGateway,
    root_url: String,
}

impl HttpSessionBackend {
    #[must_use]
    pub fn new(api: ApiClient, gateway: RetryGateway, root_url: impl Into<String>) -> Self {
        Self {
            api,
            gateway,
            root_url: root_url.into(),
        }
    }

    #[must_use]
    pub fn endpoints(&self, id_ref: &IdRef) -> SessionEndpoints {
        SessionEndpoints::new(&self.root_url, id_ref)
    }
}

#[async_trait]
impl SessionBackend for HttpSessionBackend {
    async fn fetch_metadata(&self, id_ref: &IdRef) -> Outcome<SessionMetadata> {
        let url = self.endpoints(id_ref).details_url;
        debug!(url = %url, "Fetching session details");

        let outcome = self
            .gateway
            .call(&url, || self.api.execute_bytes(ApiCall::Get { url: &url }))
            .await;

        match outcome {
            Outcome::Success(body) => Outcome::Success(decode_details(id_ref, &url, &body)),
            Outcome::Failure(failure) => {
                warn!(
                    session = %id_ref,
                    attempts = failure.attempts,
                    error = %failure.last_error,
                    "Could not fetch session details"
                );
                Outcome::Failure(failure)
            }
        }
    }

    async fn update_status(&self, id_ref: &IdRef, status: SessionStatus) -> Outcome<()> {
        let url = self.endpoints(id_ref).update_url;
        let body = json!({ "status": status });
        info!(session = %id_ref, status = %status, "Updating session status");

        let outcome = self
            .gateway
            .call(&url, || {
                let api = &self.api;
                let call = ApiCall::Put {
                    url: &url,
                    body: &body,
                };
                async move { api.execute(call).await.map(|_| ()) }
            })
            .await;

        if let Outcome::Failure(failure) = &outcome {
            warn!(
                session = %id_ref,
                status = %status,
                attempts = failure.attempts,
                error = %failure.last_error,
                "Could not update session status"
            );
        }
        outcome
    }
}
