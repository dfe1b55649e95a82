//! Typed outbound HTTP calls.
//!
//! A closed set of call shapes executed by one client. Non-2xx answers are errors so
//! that the retry gateway counts them as failed attempts.

use crate::error::ApiError;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;

/// One outbound call.
#[derive(Debug, Clone, Copy)]
pub enum ApiCall<'a> {
    Get { url: &'a str },
    Post { url: &'a str, body: &'a Value },
    Put { url: &'a str, body: &'a Value },
}

impl ApiCall<'_> {
    #[must_use]
    pub fn url(&self) -> &str {
        match self {
            Self::Get { url } | Self::Post { url, .. } | Self::Put { url, .. } => url,
        }
    }

    #[must_use]
    pub fn method(&self) -> &'static str {
        match self {
            Self::Get { .. } => "GET",
            Self::Post { .. } => "POST",
            Self::Put { .. } => "PUT",
        }
    }
}

/// JSON HTTP client shared by the backend and sidecar adapters.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
}

impl ApiClient {
    /// Create a client with JSON headers and a per-request timeout.
    pub fn new(timeout: Duration) -> Result<Self, ApiError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        Ok(Self { client })
    }

    /// Wrap an existing reqwest client.
    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Execute a call. Anything but a 2xx is an [`ApiError::Status`].
    pub async fn execute(&self, call: ApiCall<'_>) -> Result<reqwest::Response, ApiError> {
        let request = match call {
            ApiCall::Get { url } => self.client.get(url),
            ApiCall::Post { url, body } => self.client.post(url).json(body),
            ApiCall::Put { url, body } => self.client.put(url).json(body),
        };

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                url: call.url().to_string(),
            });
        }

        Ok(response)
    }

    /// Execute a call and read the whole body. Only transport and status failures are
    /// errors here, so a 2xx with an odd payload still counts as a successful attempt.
    pub async fn execute_bytes(&self, call: ApiCall<'_>) -> Result<Vec<u8>, ApiError> {
        let response = self.execute(call).await?;
        Ok(response.bytes().await?.to_vec())
    }
}

/// Decode a JSON body read from `url`.
pub fn decode_json<T: DeserializeOwned>(url: &str, body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|source| ApiError::Decode {
        url: url.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_put_sends_json_body() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/status"))
            .and(header("content-type", "application/json"))
            .and(body_json(json!({ "status": "completed" })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = ApiClient::new(Duration::from_secs(5)).unwrap();
        let url = format!("{}/status", server.uri());
        let body = json!({ "status": "completed" });
        let response = client.execute(ApiCall::Put { url: &url, body: &body }).await;

        assert!(response.is_ok());
    }

    #[tokio::test]
    async fn test_non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let client = ApiClient::new(Duration::from_secs(5)).unwrap();
        let url = format!("{}/details", server.uri());
        let err = client.execute(ApiCall::Get { url: &url }).await.unwrap_err();

        assert!(matches!(err, ApiError::Status { status: 502, .. }));
    }

    #[tokio::test]
    async fn test_undecodable_body_is_read_then_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let client = ApiClient::new(Duration::from_secs(5)).unwrap();
        let url = server.uri();
        let body = client.execute_bytes(ApiCall::Get { url: &url }).await.unwrap();
        let err = decode_json::<Value>(&url, &body).unwrap_err();

        assert!(matches!(err, ApiError::Decode { .. }));
    }

    #[test]
    fn test_call_accessors() {
        let body = json!({});
        let call = ApiCall::Post { url: "http://x/y", body: &body };
        assert_eq!(call.method(), "POST");
        assert_eq!(call.url(), "http://x/y");
    }
}
