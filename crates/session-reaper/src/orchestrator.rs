//! Synchronous termination path.
//!
//! Resolves the pod, fetches capture flags, hands a capture job to the queue and
//! reports the terminal status. Capture work itself happens in the worker pool, so
//! the caller only waits for the pod lookup and the two gated backend calls.

use crate::backend::SessionBackend;
use crate::error::{QueueError, RuntimeError};
use crate::models::{CaptureJob, SessionMetadata, TerminationAck, TerminationRequest};
use crate::queue::TaskQueue;
use crate::retry::Outcome;
use crate::runtime::{ContainerRuntime, Deletion};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

/// Why a termination did not hand the pod off for teardown.
#[derive(Debug, Error)]
pub enum TerminationError {
    /// The pod could not be resolved (missing, forbidden, runtime down).
    #[error("{0}")]
    PodLookup(#[source] RuntimeError),

    /// The queue refused the job and the direct delete also failed.
    #[error("capture job not queued ({queue}) and direct delete failed: {delete}")]
    Fallback {
        queue: QueueError,
        delete: RuntimeError,
    },

    /// The pod lookup, metadata fetch and enqueue did not finish in time.
    #[error("pod hand-off timed out after {}s", .0.as_secs_f64())]
    TimedOut(Duration),
}

/// Budget for the hand-off when none is configured.
pub const DEFAULT_HANDOFF_TIMEOUT: Duration = Duration::from_secs(120);

/// How the pod was handed off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handoff {
    /// A capture job was queued; the worker deletes the pod.
    Queued { job_id: String },
    /// Queueing failed; the pod was deleted directly without capture.
    DeletedDirectly(Deletion),
}

/// Entry point for termination requests.
#[derive(Clone)]
pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    backend: Arc<dyn SessionBackend>,
    queue: Arc<dyn TaskQueue>,
    namespace: String,
    handoff_timeout: Duration,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        backend: Arc<dyn SessionBackend>,
        queue: Arc<dyn TaskQueue>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            runtime,
            backend,
            queue,
            namespace: namespace.into(),
            handoff_timeout: DEFAULT_HANDOFF_TIMEOUT,
        }
    }

    /// Bound the hand-off. The status report still runs once the budget is spent.
    #[must_use]
    pub fn with_handoff_timeout(mut self, timeout: Duration) -> Self {
        self.handoff_timeout = timeout;
        self
    }

    /// Terminate a session. Always returns an acknowledgement; `msg` carries the outcome.
    #[instrument(skip(self, request), fields(pod_name = %request.pod_name, session = %request.id_ref))]
    pub async fn terminate(&self, request: &TerminationRequest) -> TerminationAck {
        let status = request.status();
        info!(kind = ?request.kind, status = %status, "Terminating session");

        let handoff = tokio::time::timeout(self.handoff_timeout, self.hand_off(request))
            .await
            .unwrap_or(Err(TerminationError::TimedOut(self.handoff_timeout)));

        // Reported on every path, after the job was queued.
        if let Outcome::Failure(failure) = self.backend.update_status(&request.id_ref, status).await {
            warn!(
                attempts = failure.attempts,
                error = %failure.last_error,
                "Session status was not reported"
            );
        }

        match handoff {
            Ok(handoff) => {
                info!(handoff = ?handoff, "Session terminated");
                TerminationAck::deleted()
            }
            Err(e) => {
                error!(error = %e, "Session not terminated");
                TerminationAck::not_deleted(&e.to_string())
            }
        }
    }

    async fn hand_off(&self, request: &TerminationRequest) -> Result<Handoff, TerminationError> {
        let pod = self
            .runtime
            .get_pod(&self.namespace, &request.pod_name)
            .await
            .map_err(TerminationError::PodLookup)?;

        info!(pod_ip = ?pod.ip, "Resolved pod");

        let metadata = match self.backend.fetch_metadata(&request.id_ref).await {
            Outcome::Success(metadata) => metadata,
            Outcome::Failure(_) => {
                warn!("Proceeding without session metadata; capture will be skipped");
                SessionMetadata::default()
            }
        };

        let job = CaptureJob {
            pod_name: pod.name,
            pod_ip: pod.ip,
            metadata,
        };

        match self.queue.enqueue(&job).await {
            Ok(job_id) => Ok(Handoff::Queued { job_id }),
            Err(queue_err) => {
                error!(error = %queue_err, "Failed to queue capture job, deleting pod directly");
                match self.runtime.delete_pod(&self.namespace, &job.pod_name).await {
                    Ok(deletion) => Ok(Handoff::DeletedDirectly(deletion)),
                    Err(delete_err) => Err(TerminationError::Fallback {
                        queue: queue_err,
                        delete: delete_err,
                    }),
                }
            }
        }
    }
}
