//! In-process queue with lease semantics.
//!
//! Jobs do not survive a restart. Suitable for a single replica running embedded
//! workers, and for tests.

use super::{Delivery, TaskQueue};
use crate::error::QueueError;
use crate::models::CaptureJob;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug)]
struct Entry {
    id: String,
    job: CaptureJob,
    delivery_count: u32,
    claimed_by: Option<String>,
    claimed_until: Option<Instant>,
}

/// [`TaskQueue`] held in memory.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    entries: Mutex<Vec<Entry>>,
    closed: AtomicBool,
}

impl MemoryQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject further enqueues.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Number of jobs not yet acknowledged, claimed or not.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Snapshot of queued jobs in enqueue order.
    pub async fn jobs(&self) -> Vec<CaptureJob> {
        self.entries
            .lock()
            .await
            .iter()
            .map(|entry| entry.job.clone())
            .collect()
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn enqueue(&self, job: &CaptureJob) -> Result<String, QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }

        let id = format!("capture-job-{}", Uuid::new_v4());
        self.entries.lock().await.push(Entry {
            id: id.clone(),
            job: job.clone(),
            delivery_count: 0,
            claimed_by: None,
            claimed_until: None,
        });
        debug!(job_id = %id, pod_name = %job.pod_name, "Enqueued capture job");
        Ok(id)
    }

    async fn claim(&self, worker_id: &str, lease: Duration) -> Result<Option<Delivery>, QueueError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        let Some(entry) = entries
            .iter_mut()
            .find(|entry| entry.claimed_until.is_none_or(|until| until <= now))
        else {
            return Ok(None);
        };

        entry.claimed_by = Some(worker_id.to_string());
        entry.claimed_until = Some(now + lease);
        entry.delivery_count += 1;
        debug!(job_id = %entry.id, worker_id = %worker_id, "Claimed capture job");

        Ok(Some(Delivery {
            id: entry.id.clone(),
            job: entry.job.clone(),
            delivery_count: entry.delivery_count,
        }))
    }

    async fn renew(&self, delivery: &Delivery, worker_id: &str, lease: Duration) -> Result<bool, QueueError> {
        let mut entries = self.entries.lock().await;

        let Some(entry) = entries
            .iter_mut()
            .find(|entry| entry.id == delivery.id && entry.claimed_by.as_deref() == Some(worker_id))
        else {
            return Ok(false);
        };

        entry.claimed_until = Some(Instant::now() + lease);
        Ok(true)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.entries
            .lock()
            .await
            .retain(|entry| entry.id != delivery.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SessionMetadata;

    fn job(pod: &str) -> CaptureJob {
        CaptureJob {
            pod_name: pod.to_string(),
            pod_ip: Some("10.0.0.1".to_string()),
            metadata: SessionMetadata::default(),
        }
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_while_leased() {
        let queue = MemoryQueue::new();
        queue.enqueue(&job("p1")).await.unwrap();

        let first = queue.claim("a", Duration::from_secs(60)).await.unwrap();
        let second = queue.claim("b", Duration::from_secs(60)).await.unwrap();

        assert_eq!(first.unwrap().job.pod_name, "p1");
        assert!(second.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_redelivers() {
        let queue = MemoryQueue::new();
        let id = queue.enqueue(&job("p1")).await.unwrap();

        let first = queue.claim("a", Duration::from_secs(10)).await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        let second = queue.claim("b", Duration::from_secs(10)).await.unwrap().unwrap();

        assert_eq!(first.id, id);
        assert_eq!(second.id, id);
        assert_eq!(second.delivery_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_keeps_lease_only_for_its_holder() {
        let queue = MemoryQueue::new();
        queue.enqueue(&job("p1")).await.unwrap();
        let lease = Duration::from_secs(10);

        let delivery = queue.claim("a", lease).await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(queue.renew(&delivery, "a", lease).await.unwrap());
        assert!(!queue.renew(&delivery, "b", lease).await.unwrap());

        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(queue.claim("b", lease).await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(2)).await;
        let taken = queue.claim("b", lease).await.unwrap().unwrap();
        assert_eq!(taken.delivery_count, 2);
        assert!(!queue.renew(&delivery, "a", lease).await.unwrap());

        queue.ack(&taken).await.unwrap();
        assert!(!queue.renew(&taken, "b", lease).await.unwrap());
    }

    #[tokio::test]
    async fn test_ack_removes_and_is_idempotent() {
        let queue = MemoryQueue::new();
        queue.enqueue(&job("p1")).await.unwrap();
        let delivery = queue.claim("a", Duration::from_secs(10)).await.unwrap().unwrap();

        queue.ack(&delivery).await.unwrap();
        queue.ack(&delivery).await.unwrap();

        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_enqueue() {
        let queue = MemoryQueue::new();
        queue.close();

        assert!(matches!(queue.enqueue(&job("p1")).await, Err(QueueError::Closed)));
    }
}
