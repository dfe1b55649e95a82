//! Asynchronous capture and cleanup of a terminated session's pod.
//!
//! Phases run in order: stop the video recorder, upload the browser logs, delete the
//! pod. The first two are best effort. Pod deletion runs after them on every path,
//! including a panic inside a capture phase.

use crate::artifacts::ArtifactStore;
use crate::error::{HandlerError, RuntimeError};
use crate::models::CaptureJob;
use crate::queue::JobHandler;
use crate::retry::Outcome;
use crate::runtime::{ContainerRuntime, Deletion};
use crate::sidecar::VideoSidecar;
use async_trait::async_trait;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Container whose logs are captured.
pub const DEFAULT_BROWSER_CONTAINER: &str = "browser";

/// How one best-effort phase ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// Disabled in the session metadata.
    Skipped,
    Done,
    Failed(String),
}

/// Per-phase summary of one capture run.
#[derive(Debug)]
pub struct CaptureReport {
    pub video: PhaseOutcome,
    pub logs: PhaseOutcome,
    pub deletion: Result<Deletion, RuntimeError>,
}

impl CaptureReport {
    /// True when the pod is known to be gone.
    #[must_use]
    pub fn pod_removed(&self) -> bool {
        self.deletion.is_ok()
    }
}

/// Consumer of capture jobs.
#[derive(Clone)]
pub struct CaptureWorker {
    runtime: Arc<dyn ContainerRuntime>,
    sidecar: Arc<dyn VideoSidecar>,
    artifacts: Arc<dyn ArtifactStore>,
    namespace: String,
    container: String,
}

impl CaptureWorker {
    #[must_use]
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        sidecar: Arc<dyn VideoSidecar>,
        artifacts: Arc<dyn ArtifactStore>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            runtime,
            sidecar,
            artifacts,
            namespace: namespace.into(),
            container: DEFAULT_BROWSER_CONTAINER.to_string(),
        }
    }

    /// Capture logs from a different container.
    #[must_use]
    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = container.into();
        self
    }

    /// Run all phases for one delivery of `job`.
    pub async fn capture(&self, job: &CaptureJob) -> CaptureReport {
        info!(pod_name = %job.pod_name, pod_ip = ?job.pod_ip, "Capturing session artifacts");

        let video = guarded("video", &job.pod_name, self.stop_recording(job)).await;
        let logs = guarded("logs", &job.pod_name, self.upload_logs(job)).await;

        let deletion = self.delete_pod(&job.pod_name).await;

        CaptureReport {
            video,
            logs,
            deletion,
        }
    }

    async fn stop_recording(&self, job: &CaptureJob) -> PhaseOutcome {
        if !job.metadata.enable_video {
            return PhaseOutcome::Skipped;
        }

        let Some(pod_ip) = job.pod_ip.as_deref() else {
            warn!(pod_name = %job.pod_name, "No pod IP, cannot stop video recording");
            return PhaseOutcome::Failed("pod has no IP".to_string());
        };

        info!(pod_name = %job.pod_name, "Stopping video recording");
        match self.sidecar.stop_recording(pod_ip).await {
            Outcome::Success(()) => PhaseOutcome::Done,
            Outcome::Failure(failure) => PhaseOutcome::Failed(failure.last_error),
        }
    }

    async fn upload_logs(&self, job: &CaptureJob) -> PhaseOutcome {
        if !job.metadata.enable_logs {
            return PhaseOutcome::Skipped;
        }

        let Some(log_name) = job.metadata.log_name.as_deref().filter(|name| !name.is_empty())
        else {
            warn!(pod_name = %job.pod_name, "Log capture enabled without a log name");
            return PhaseOutcome::Failed("missing log_name".to_string());
        };

        let started = Instant::now();
        let logs = match self
            .runtime
            .get_pod_logs(&self.namespace, &job.pod_name, &self.container)
            .await
        {
            Ok(logs) => logs,
            Err(e) => {
                warn!(pod_name = %job.pod_name, error = %e, "Failed to fetch pod logs");
                return PhaseOutcome::Failed(e.to_string());
            }
        };

        match self.artifacts.upload(log_name, logs.into_bytes()).await {
            Ok(()) => {
                info!(
                    pod_name = %job.pod_name,
                    key = %log_name,
                    elapsed_ms = started.elapsed().as_millis(),
                    "Uploaded pod logs"
                );
                PhaseOutcome::Done
            }
            Err(e) => {
                warn!(pod_name = %job.pod_name, key = %log_name, error = %e, "Failed to upload pod logs");
                PhaseOutcome::Failed(e.to_string())
            }
        }
    }

    async fn delete_pod(&self, pod_name: &str) -> Result<Deletion, RuntimeError> {
        info!(pod_name = %pod_name, "Deleting pod");
        let result = self.runtime.delete_pod(&self.namespace, pod_name).await;
        match &result {
            Ok(Deletion::Deleted) => info!(pod_name = %pod_name, "Pod deleted"),
            Ok(Deletion::AlreadyGone) => info!(pod_name = %pod_name, "Pod was already deleted"),
            Err(e) => error!(pod_name = %pod_name, error = %e, "Failed to delete pod"),
        }
        result
    }
}

/// Run one phase, turning a panic into a failed phase.
async fn guarded<F>(phase: &'static str, pod_name: &str, run: F) -> PhaseOutcome
where
    F: Future<Output = PhaseOutcome>,
{
    AssertUnwindSafe(run).catch_unwind().await.unwrap_or_else(|_| {
        error!(pod_name = %pod_name, phase, "Capture phase panicked");
        PhaseOutcome::Failed(format!("{phase} phase panicked"))
    })
}

#[async_trait]
impl JobHandler for CaptureWorker {
    async fn handle(&self, job: &CaptureJob) -> Result<(), HandlerError> {
        let report = self.capture(job).await;
        info!(
            pod_name = %job.pod_name,
            video = ?report.video,
            logs = ?report.logs,
            "Capture finished"
        );
        report.deletion.map(|_| ()).map_err(HandlerError::Deletion)
    }
}
