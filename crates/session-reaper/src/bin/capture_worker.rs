//! Capture worker - standalone consumer of the capture-job queue
//!
//! Runs the worker pool against the durable `ConfigMap` queue so capture work can scale
//! separately from the termination API.

use anyhow::{bail, Context, Result};
use session_reaper::http::ApiClient;
use session_reaper::server::shutdown_signal;
use session_reaper::{
    telemetry, CaptureWorker, Config, ConfigMapQueue, HttpArtifactStore, HttpVideoSidecar,
    KubeRuntime, QueueBackend, RetryGateway, WorkerPool,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env().context("invalid configuration")?;
    telemetry::init(config.log_format);
    info!("Starting capture-worker v{}", env!("CARGO_PKG_VERSION"));

    if config.queue_backend != QueueBackend::ConfigMap {
        bail!("capture-worker needs QUEUE_BACKEND=configmap; the memory queue is process-local");
    }

    let client = kube::Client::try_default().await?;
    info!(namespace = %config.org_name, "Connected to Kubernetes cluster");

    let runtime = Arc::new(KubeRuntime::new(client.clone()));
    let sidecar = Arc::new(HttpVideoSidecar::new(
        ApiClient::new(config.http_timeout)?,
        RetryGateway::new(config.retry_policy()),
        config.sidecar_port,
    ));
    let artifacts = Arc::new(HttpArtifactStore::new(
        config.artifact_store_url.clone(),
        config.s3_bucket.clone(),
        config.artifact_auth(),
        config.http_timeout,
    )?);
    let worker = CaptureWorker::new(runtime, sidecar, artifacts, config.org_name.clone())
        .with_container(config.browser_container.clone());

    let queue = Arc::new(ConfigMapQueue::new(client, &config.org_name));
    let shutdown = CancellationToken::new();
    let pool = WorkerPool::subscribe(queue, Arc::new(worker), config.pool_settings(), shutdown);

    shutdown_signal().await;
    pool.shutdown().await;
    info!("capture-worker stopped");

    Ok(())
}
