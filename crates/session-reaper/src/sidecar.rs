//! Video recorder sidecar running next to the browser in each pod.

use crate::http::{ApiCall, ApiClient};
use crate::retry::{Outcome, RetryGateway};
use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{info, warn};

/// Default port of the recorder sidecar.
pub const DEFAULT_SIDECAR_PORT: u16 = 9092;

/// Control surface of the video recorder.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VideoSidecar: Send + Sync {
    /// Stop the recording on the pod at `pod_ip`; the sidecar uploads the video itself.
    async fn stop_recording(&self, pod_ip: &str) -> Outcome<()>;
}

/// [`VideoSidecar`] reached over HTTP on the pod IP.
#[derive(Debug, Clone)]
pub struct HttpVideoSidecar {
    api: ApiClient,
    gateway: RetryGateway,
    port: u16,
}

impl HttpVideoSidecar {
    #[must_use]
    pub fn new(api: ApiClient, gateway: RetryGateway, port: u16) -> Self {
        Self { api, gateway, port }
    }

    #[must_use]
    pub fn stop_url(&self, pod_ip: &str) -> String {
        format!("http://{pod_ip}:{}/stop-recording", self.port)
    }
}

#[async_trait]
impl VideoSidecar for HttpVideoSidecar {
    async fn stop_recording(&self, pod_ip: &str) -> Outcome<()> {
        let url = self.stop_url(pod_ip);
        let started = Instant::now();

        let outcome = self
            .gateway
            .call(&url, || {
                let api = &self.api;
                let call = ApiCall::Get { url: &url };
                async move { api.execute(call).await.map(|_| ()) }
            })
            .await;

        let elapsed = started.elapsed();
        match &outcome {
            Outcome::Success(()) => {
                info!(pod_ip = %pod_ip, elapsed_ms = elapsed.as_millis(), "Video recording stopped");
            }
            Outcome::Failure(failure) => {
                warn!(
                    pod_ip = %pod_ip,
                    attempts = failure.attempts,
                    error = %failure.last_error,
                    "Couldn't stop video recorder"
                );
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use std::time::Duration;

    #[test]
    fn test_stop_url_uses_pod_ip_and_port() {
        let sidecar = HttpVideoSidecar::new(
            ApiClient::new(Duration::from_secs(1)).unwrap(),
            RetryGateway::new(RetryPolicy::default()),
            DEFAULT_SIDECAR_PORT,
        );
        assert_eq!(sidecar.stop_url("10.0.0.5"), "http://10.0.0.5:9092/stop-recording");
    }

    #[tokio::test]
    async fn test_unreachable_sidecar_yields_failure() {
        // Port 9 (discard) is closed on loopback in test environments.
        let sidecar = HttpVideoSidecar::new(
            ApiClient::new(Duration::from_millis(500)).unwrap(),
            RetryGateway::new(RetryPolicy::new(2, Duration::from_millis(5))),
            9,
        );

        let outcome = sidecar.stop_recording("127.0.0.1").await;

        assert!(!outcome.is_success());
    }
}
