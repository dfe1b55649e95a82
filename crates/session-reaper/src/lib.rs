//! Browser session termination service.
//!
//! This crate provides:
//! - The synchronous termination path (`Orchestrator`) behind an axum HTTP surface
//! - A durable, at-least-once capture-job queue with `ConfigMap` and in-memory backends
//! - The capture worker that stops video recording, uploads browser logs and deletes the pod
//! - A retry gateway for calls to the session backend and the video sidecar

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]

pub mod artifacts;
pub mod backend;
pub mod config;
pub mod error;
pub mod http;
pub mod models;
pub mod orchestrator;
pub mod queue;
pub mod retry;
pub mod runtime;
pub mod server;
pub mod sidecar;
pub mod telemetry;
pub mod worker;

pub use artifacts::{ArtifactAuth, ArtifactStore, AwsCredentials, HttpArtifactStore};
pub use backend::{HttpSessionBackend, SessionBackend};
pub use config::{Config, QueueBackend};
pub use error::{ApiError, ArtifactError, ConfigError, HandlerError, QueueError, RuntimeError};
pub use models::*;
pub use orchestrator::{Handoff, Orchestrator, TerminationError};
pub use queue::{ConfigMapQueue, MemoryQueue, PoolSettings, TaskQueue, WorkerPool};
pub use retry::{GatewayFailure, Outcome, RetryGateway, RetryPolicy};
pub use runtime::{ContainerRuntime, Deletion, KubeRuntime};
pub use sidecar::{HttpVideoSidecar, VideoSidecar};
pub use worker::{CaptureReport, CaptureWorker, PhaseOutcome};
