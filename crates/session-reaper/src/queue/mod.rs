//! At-least-once capture-job queue and the worker pool that drains it.
//!
//! Claims are leases: a delivery that is not acknowledged before its lease runs out
//! becomes claimable again, so a crashed or failed worker leads to redelivery. While a
//! lease is live no other worker can claim the same job. Workers renew the lease on a
//! heartbeat for as long as the handler runs.

pub mod configmap;
pub mod memory;

pub use configmap::ConfigMapQueue;
pub use memory::MemoryQueue;

use crate::error::{HandlerError, QueueError};
use crate::models::CaptureJob;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// One delivery of a queued job to a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Queue-assigned job id, stable across redeliveries.
    pub id: String,
    pub job: CaptureJob,
    /// 1 on first delivery, incremented on every redelivery.
    pub delivery_count: u32,
}

/// Durable, at-least-once job queue.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Persist a job and return its id.
    async fn enqueue(&self, job: &CaptureJob) -> Result<String, QueueError>;

    /// Lease the next available job to `worker_id` for `lease`.
    async fn claim(&self, worker_id: &str, lease: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Extend `worker_id`'s lease on a delivery. Returns `false` when the lease is no
    /// longer held by `worker_id` (taken over by another worker, or the job is gone).
    async fn renew(&self, delivery: &Delivery, worker_id: &str, lease: Duration) -> Result<bool, QueueError>;

    /// Remove a job after it has been handled. Acking a job that is already gone is fine.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;
}

/// Consumer of queued jobs.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Handle one delivery. An error leaves the job for redelivery.
    async fn handle(&self, job: &CaptureJob) -> Result<(), HandlerError>;
}

/// Worker pool tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub concurrency: usize,
    /// Renewed every third of its length while a handler runs.
    pub lease: Duration,
    pub poll_interval: Duration,
    /// Deliveries beyond this count are dropped with an error log.
    pub max_deliveries: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            lease: Duration::from_secs(300),
            poll_interval: Duration::from_secs(1),
            max_deliveries: 5,
        }
    }
}

/// Running worker pool.
pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// Start `settings.concurrency` workers that feed `queue` deliveries to `handler`.
    #[must_use]
    pub fn subscribe(
        queue: Arc<dyn TaskQueue>,
        handler: Arc<dyn JobHandler>,
        settings: PoolSettings,
        shutdown: CancellationToken,
    ) -> Self {
        let concurrency = settings.concurrency.max(1);
        info!(concurrency, lease_secs = settings.lease.as_secs(), "Starting capture workers");

        let workers = (0..concurrency)
            .map(|index| {
                let worker_id = format!("{}-{index}", worker_prefix());
                let span = tracing::info_span!("capture_worker", worker_id = %worker_id);
                tokio::spawn(
                    run_worker(
                        worker_id,
                        Arc::clone(&queue),
                        Arc::clone(&handler),
                        settings,
                        shutdown.clone(),
                    )
                    .instrument(span),
                )
            })
            .collect();

        Self { workers, shutdown }
    }

    /// Stop claiming new jobs and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Capture worker terminated abnormally");
            }
        }
        info!("Capture workers stopped");
    }
}

fn worker_prefix() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "capture-worker".to_string())
}

async fn run_worker(
    worker_id: String,
    queue: Arc<dyn TaskQueue>,
    handler: Arc<dyn JobHandler>,
    settings: PoolSettings,
    shutdown: CancellationToken,
) {
    debug!("Worker started");

    while !shutdown.is_cancelled() {
        match queue.claim(&worker_id, settings.lease).await {
            Ok(Some(delivery)) => {
                process_delivery(queue.as_ref(), &handler, delivery, &worker_id, settings).await;
                continue;
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to claim capture job"),
        }

        tokio::select! {
            () = tokio::time::sleep(settings.poll_interval) => {}
            () = shutdown.cancelled() => break,
        }
    }

    debug!("Worker stopped");
}

/// Run the handler for one delivery, keeping its lease alive, and acknowledge it on success.
pub async fn process_delivery(
    queue: &dyn TaskQueue,
    handler: &Arc<dyn JobHandler>,
    delivery: Delivery,
    worker_id: &str,
    settings: PoolSettings,
) {
    let pod_name = delivery.job.pod_name.clone();

    if delivery.delivery_count > settings.max_deliveries {
        error!(
            job_id = %delivery.id,
            pod_name = %pod_name,
            deliveries = delivery.delivery_count,
            "Capture job exceeded delivery limit, dropping it"
        );
        ack(queue, &delivery).await;
        return;
    }

    info!(
        job_id = %delivery.id,
        pod_name = %pod_name,
        delivery = delivery.delivery_count,
        "Processing capture job"
    );

    // Run on its own task so a panicking handler only loses this delivery.
    let handler = Arc::clone(handler);
    let job = delivery.job.clone();
    let mut task = tokio::spawn(async move { handler.handle(&job).await });

    let mut heartbeat = tokio::time::interval(heartbeat_period(settings.lease));
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await;

    let result = loop {
        tokio::select! {
            result = &mut task => break result,
            _ = heartbeat.tick() => renew(queue, &delivery, worker_id, settings.lease).await,
        }
    };

    match result {
        Ok(Ok(())) => ack(queue, &delivery).await,
        Ok(Err(e)) => warn!(
            job_id = %delivery.id,
            pod_name = %pod_name,
            error = %e,
            "Capture job failed, leaving it for redelivery"
        ),
        Err(e) => error!(
            job_id = %delivery.id,
            pod_name = %pod_name,
            error = %e,
            "Capture job panicked, leaving it for redelivery"
        ),
    }
}

fn heartbeat_period(lease: Duration) -> Duration {
    (lease / 3).max(Duration::from_millis(1))
}

async fn renew(queue: &dyn TaskQueue, delivery: &Delivery, worker_id: &str, lease: Duration) {
    match queue.renew(delivery, worker_id, lease).await {
        Ok(true) => debug!(job_id = %delivery.id, "Renewed capture job lease"),
        Ok(false) => warn!(
            job_id = %delivery.id,
            "Lost lease on running capture job, it may be delivered again"
        ),
        Err(e) => warn!(job_id = %delivery.id, error = %e, "Failed to renew capture job lease"),
    }
}

async fn ack(queue: &dyn TaskQueue, delivery: &Delivery) {
    if let Err(e) = queue.ack(delivery).await {
        warn!(job_id = %delivery.id, error = %e, "Failed to acknowledge capture job");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SessionMetadata;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    fn settings(lease: Duration) -> PoolSettings {
        PoolSettings {
            concurrency: 2,
            lease,
            poll_interval: Duration::from_millis(10),
            max_deliveries: 5,
        }
    }

    fn job(pod: &str) -> CaptureJob {
        CaptureJob {
            pod_name: pod.to_string(),
            pod_ip: None,
            metadata: SessionMetadata::default(),
        }
    }

    /// Fails the first `failures` calls, then succeeds.
    struct FlakyHandler {
        calls: AtomicU32,
        failures: u32,
        panic_instead: bool,
    }

    #[async_trait]
    impl JobHandler for FlakyHandler {
        async fn handle(&self, _job: &CaptureJob) -> Result<(), HandlerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                if self.panic_instead {
                    panic!("handler blew up");
                }
                return Err(HandlerError::Other("transient".to_string()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_successful_delivery_is_acked() {
        let queue = MemoryQueue::new();
        queue.enqueue(&job("p1")).await.unwrap();
        let handler: Arc<dyn JobHandler> = Arc::new(FlakyHandler {
            calls: AtomicU32::new(0),
            failures: 0,
            panic_instead: false,
        });

        let delivery = queue.claim("w", Duration::from_secs(30)).await.unwrap().unwrap();
        process_delivery(&queue, &handler, delivery, "w", settings(Duration::from_secs(30))).await;

        assert_eq!(queue.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_delivery_is_redelivered_after_lease() {
        let queue = MemoryQueue::new();
        queue.enqueue(&job("p1")).await.unwrap();
        let handler: Arc<dyn JobHandler> = Arc::new(FlakyHandler {
            calls: AtomicU32::new(0),
            failures: 1,
            panic_instead: true,
        });
        let lease = Duration::from_secs(30);

        let first = queue.claim("w", lease).await.unwrap().unwrap();
        process_delivery(&queue, &handler, first, "w", settings(lease)).await;
        assert_eq!(queue.len().await, 1);
        assert!(queue.claim("w", lease).await.unwrap().is_none());

        tokio::time::advance(lease).await;
        let second = queue.claim("w", lease).await.unwrap().unwrap();
        assert_eq!(second.delivery_count, 2);
        process_delivery(&queue, &handler, second, "w", settings(lease)).await;

        assert_eq!(queue.len().await, 0);
    }

    #[tokio::test]
    async fn test_delivery_over_limit_is_dropped_without_handling() {
        let queue = MemoryQueue::new();
        queue.enqueue(&job("p1")).await.unwrap();
        let flaky = Arc::new(FlakyHandler {
            calls: AtomicU32::new(0),
            failures: 0,
            panic_instead: false,
        });
        let handler: Arc<dyn JobHandler> = flaky.clone();

        let mut delivery = queue.claim("w", Duration::from_secs(30)).await.unwrap().unwrap();
        delivery.delivery_count = 6;
        process_delivery(&queue, &handler, delivery, "w", settings(Duration::from_secs(30))).await;

        assert_eq!(flaky.calls.load(Ordering::SeqCst), 0);
        assert_eq!(queue.len().await, 0);
    }

    #[tokio::test]
    async fn test_pool_drains_queue_and_shuts_down() {
        let queue = Arc::new(MemoryQueue::new());
        for pod in ["p1", "p2", "p3"] {
            queue.enqueue(&job(pod)).await.unwrap();
        }
        let flaky = Arc::new(FlakyHandler {
            calls: AtomicU32::new(0),
            failures: 0,
            panic_instead: false,
        });

        let pool = WorkerPool::subscribe(
            queue.clone(),
            flaky.clone(),
            settings(Duration::from_secs(30)),
            CancellationToken::new(),
        );

        for _ in 0..200 {
            if queue.len().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        pool.shutdown().await;

        assert_eq!(queue.len().await, 0);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    /// Takes longer than one lease and records how many copies run at once.
    struct SlowHandler {
        calls: AtomicU32,
        running: AtomicUsize,
        max_running: AtomicUsize,
        run_for: Duration,
    }

    #[async_trait]
    impl JobHandler for SlowHandler {
        async fn handle(&self, _job: &CaptureJob) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(self.run_for).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_outliving_lease_is_not_run_twice() {
        let queue = Arc::new(MemoryQueue::new());
        queue.enqueue(&job("p1")).await.unwrap();
        let slow = Arc::new(SlowHandler {
            calls: AtomicU32::new(0),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            run_for: Duration::from_millis(300),
        });

        let pool = WorkerPool::subscribe(
            queue.clone(),
            slow.clone(),
            settings(Duration::from_millis(100)),
            CancellationToken::new(),
        );

        for _ in 0..100 {
            if queue.is_empty().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        pool.shutdown().await;

        assert!(queue.is_empty().await);
        assert_eq!(slow.calls.load(Ordering::SeqCst), 1);
        assert_eq!(slow.max_running.load(Ordering::SeqCst), 1);
    }
}
