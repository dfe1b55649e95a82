//! Session reaper - browser session termination service
//!
//! Serves the termination API and, unless `EMBEDDED_WORKERS=false`, runs the capture
//! worker pool in the same process.

use anyhow::{bail, Context, Result};
use clap::Parser;
use session_reaper::http::ApiClient;
use session_reaper::queue::TaskQueue;
use session_reaper::server::{self, AppState};
use session_reaper::{
    telemetry, CaptureWorker, Config, ConfigMapQueue, HttpArtifactStore, HttpSessionBackend,
    HttpVideoSidecar, KubeRuntime, MemoryQueue, Orchestrator, QueueBackend, RetryGateway,
    WorkerPool,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Browser session termination service.
#[derive(Parser, Debug)]
#[command(name = "session-reaper")]
#[command(version)]
struct Args {
    /// Bind address (overrides HOST)
    #[arg(long)]
    host: Option<String>,

    /// Listen port (overrides PORT)
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = Config::from_env().context("invalid configuration")?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    telemetry::init(config.log_format);
    info!("Starting session-reaper v{}", env!("CARGO_PKG_VERSION"));

    if config.queue_backend == QueueBackend::Memory && !config.embedded_workers {
        bail!("QUEUE_BACKEND=memory requires EMBEDDED_WORKERS=true");
    }

    let client = kube::Client::try_default().await?;
    info!(namespace = %config.org_name, "Connected to Kubernetes cluster");

    let runtime = Arc::new(KubeRuntime::new(client.clone()));
    let api = ApiClient::new(config.http_timeout)?;
    let gateway = RetryGateway::new(config.retry_policy());
    let backend = Arc::new(HttpSessionBackend::new(
        api.clone(),
        gateway,
        config.backend_root_url.clone(),
    ));

    let queue: Arc<dyn TaskQueue> = match config.queue_backend {
        QueueBackend::ConfigMap => Arc::new(ConfigMapQueue::new(client, &config.org_name)),
        QueueBackend::Memory => Arc::new(MemoryQueue::new()),
    };
    info!(backend = ?config.queue_backend, "Capture queue ready");

    let shutdown = CancellationToken::new();
    let pool = if config.embedded_workers {
        let artifacts = Arc::new(HttpArtifactStore::new(
            config.artifact_store_url.clone(),
            config.s3_bucket.clone(),
            config.artifact_auth(),
            config.http_timeout,
        )?);
        let sidecar = Arc::new(HttpVideoSidecar::new(api, gateway, config.sidecar_port));
        let worker = CaptureWorker::new(runtime.clone(), sidecar, artifacts, config.org_name.clone())
            .with_container(config.browser_container.clone());

        Some(WorkerPool::subscribe(
            Arc::clone(&queue),
            Arc::new(worker),
            config.pool_settings(),
            shutdown.clone(),
        ))
    } else {
        info!("Embedded workers disabled; capture jobs are drained by capture-worker");
        None
    };

    let orchestrator = Orchestrator::new(runtime, backend, queue, config.org_name.clone())
        .with_handoff_timeout(config.handoff_timeout());
    let app = server::router(
        AppState {
            orchestrator: Arc::new(orchestrator),
        },
        config.request_timeout(),
    );

    let address = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;
    info!("HTTP server listening on {}", address);

    axum::serve(listener, app)
        .with_graceful_shutdown(server::shutdown_signal())
        .await?;

    if let Some(pool) = pool {
        pool.shutdown().await;
    }
    info!("session-reaper stopped");

    Ok(())
}
