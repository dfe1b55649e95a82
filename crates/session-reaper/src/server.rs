//! HTTP surface of the termination service.

use crate::models::{RequestError, TerminationAck, TerminationKind, TerminationRequest};
use crate::orchestrator::Orchestrator;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer,
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, warn, Level};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

/// Build the router.
///
/// `request_timeout` is a last-resort bound on a whole request. The orchestrator's own
/// hand-off budget should expire first so callers still get the JSON acknowledgement.
pub fn router(state: AppState, request_timeout: Duration) -> Router {
    let api = Router::new()
        .route(
            "/session/{pod_name}/{session_id}/{delete_type}",
            delete(delete_session),
        )
        .route(
            "/timeout/{pod_name}/{request_id}/{delete_type}",
            delete(delete_timed_out_session),
        );

    Router::new()
        .nest("/api/v1", api)
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                        .on_response(DefaultOnResponse::new().level(Level::INFO)),
                )
                .layer(CorsLayer::permissive())
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::REQUEST_TIMEOUT,
                    request_timeout,
                )),
        )
        .with_state(state)
}

async fn delete_session(
    State(state): State<AppState>,
    Path((pod_name, session_id, delete_type)): Path<(String, String, String)>,
) -> Json<TerminationAck> {
    let kind = TerminationKind::from_delete_type(&delete_type);
    let request = TerminationRequest::for_session(pod_name, &session_id, kind);
    Json(run(&state, request).await)
}

async fn delete_timed_out_session(
    State(state): State<AppState>,
    Path((pod_name, request_id, delete_type)): Path<(String, String, String)>,
) -> Json<TerminationAck> {
    let kind = TerminationKind::from_delete_type(&delete_type);
    let request = TerminationRequest::for_request(pod_name, &request_id, kind);
    Json(run(&state, request).await)
}

async fn run(
    state: &AppState,
    request: Result<TerminationRequest, RequestError>,
) -> TerminationAck {
    match request {
        Ok(request) => state.orchestrator.terminate(&request).await,
        Err(e) => {
            warn!(error = %e, "Rejected termination request");
            TerminationAck::not_deleted(&e.to_string())
        }
    }
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "session-reaper",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness_check() -> Json<Value> {
    Json(json!({
        "status": "ready",
        "service": "session-reaper",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
