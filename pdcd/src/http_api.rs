//! HTTP API for rollout control, the request-path hook, and
//! observability.
//!
//! Control endpoints (start/stop/status/promote/rollback) are consumed
//! by operators and CI; `/route` and `/record` are the narrow interface
//! the request-handling application calls around each request;
//! `/health` and `/metrics` serve probes and Prometheus scrapes.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;

use crate::controller::RolloutManager;
use crate::history::DeploymentHistoryStore;
use crate::metrics;
use crate::router::TrafficRouter;
use pdc_common::api::{
    ErrorResponse, IdentityRequest, RecordRequest, RollbackRequest, RollbackResponse, RolloutAck,
    RouteRequest, RouteResponse, StartRolloutRequest,
};
use pdc_common::errors::ControlError;
use pdc_common::types::{DeploymentVersion, RolloutStatus};

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    pub manager: Arc<RolloutManager>,
    pub router: Arc<TrafficRouter>,
    pub history: Arc<DeploymentHistoryStore>,
    /// Daemon version.
    pub version: &'static str,
    /// Daemon start time.
    pub started_at: Instant,
    /// Daemon PID.
    pub pid: u32,
}

/// Control-error wrapper that maps the taxonomy onto HTTP statuses.
struct ApiError(ControlError);

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ControlError::InvalidConfig(_) | ControlError::InvalidRule { .. } => {
                StatusCode::BAD_REQUEST
            }
            ControlError::AlreadyRunning(_) | ControlError::NoRollbackTarget => {
                StatusCode::CONFLICT
            }
            ControlError::NotRunning(_) => StatusCode::NOT_FOUND,
            ControlError::RollbackFailed(_) => StatusCode::BAD_GATEWAY,
        };
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

/// Create the HTTP router for all daemon endpoints.
pub fn create_router(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/rollouts", post(start_rollout_handler))
        .route("/rollouts/{name}", get(rollout_status_handler))
        .route("/rollouts/{name}/stop", post(stop_rollout_handler))
        .route("/rollouts/{name}/promote", post(promote_rollout_handler))
        .route("/rollouts/{name}/rollback", post(rollback_rollout_handler))
        .route("/route", post(route_handler))
        .route("/record", post(record_handler))
        .route("/router/stats", get(router_stats_handler))
        .route("/router/stats/reset", post(reset_router_stats_handler))
        .route("/router/whitelist", post(whitelist_handler))
        .route("/router/blacklist", post(blacklist_handler))
        .route("/history", get(history_list_handler).post(history_record_handler))
        .with_state(Arc::new(state))
}

/// Handler for `/health` - basic daemon health check.
async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let uptime_secs = state.started_at.elapsed().as_secs();
    Json(json!({
        "status": "healthy",
        "version": state.version,
        "pid": state.pid,
        "uptime_seconds": uptime_secs,
    }))
}

/// Handler for `/metrics` - Prometheus metrics export.
async fn metrics_handler() -> impl IntoResponse {
    match metrics::encode_metrics() {
        Ok(output) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            output,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response(),
    }
}

async fn start_rollout_handler(
    State(state): State<Arc<HttpState>>,
    Json(req): Json<StartRolloutRequest>,
) -> Result<(StatusCode, Json<RolloutStatus>), ApiError> {
    let status = state.manager.start(req.config, req.target).await?;
    Ok((StatusCode::CREATED, Json(status)))
}

async fn rollout_status_handler(
    State(state): State<Arc<HttpState>>,
    Path(name): Path<String>,
) -> Result<Json<RolloutStatus>, ApiError> {
    Ok(Json(state.manager.status(&name).await?))
}

async fn stop_rollout_handler(
    State(state): State<Arc<HttpState>>,
    Path(name): Path<String>,
) -> Result<Json<RolloutAck>, ApiError> {
    state.manager.stop(&name).await?;
    let status = state.manager.status(&name).await?;
    Ok(Json(ack(&status)))
}

async fn promote_rollout_handler(
    State(state): State<Arc<HttpState>>,
    Path(name): Path<String>,
) -> Result<Json<RolloutAck>, ApiError> {
    let status = state.manager.promote(&name).await?;
    Ok(Json(ack(&status)))
}

async fn rollback_rollout_handler(
    State(state): State<Arc<HttpState>>,
    Path(name): Path<String>,
    Json(req): Json<RollbackRequest>,
) -> Result<Json<RollbackResponse>, ApiError> {
    let outcome = state.manager.rollback(&name, req.reason).await?;
    Ok(Json(RollbackResponse {
        rolled_back_to: outcome.to,
    }))
}

async fn route_handler(
    State(state): State<Arc<HttpState>>,
    Json(req): Json<RouteRequest>,
) -> Json<RouteResponse> {
    Json(RouteResponse {
        target: state.router.route(&req.context),
    })
}

async fn record_handler(
    State(state): State<Arc<HttpState>>,
    Json(req): Json<RecordRequest>,
) -> StatusCode {
    state
        .manager
        .record(&req.target, req.success, req.latency_ms)
        .await;
    StatusCode::NO_CONTENT
}

async fn router_stats_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    Json(state.router.stats())
}

async fn reset_router_stats_handler(State(state): State<Arc<HttpState>>) -> StatusCode {
    state.router.reset_stats();
    StatusCode::NO_CONTENT
}

async fn whitelist_handler(
    State(state): State<Arc<HttpState>>,
    Json(req): Json<IdentityRequest>,
) -> StatusCode {
    state.router.add_to_whitelist(req.user_id);
    StatusCode::NO_CONTENT
}

async fn blacklist_handler(
    State(state): State<Arc<HttpState>>,
    Json(req): Json<IdentityRequest>,
) -> StatusCode {
    state.router.add_to_blacklist(req.user_id);
    StatusCode::NO_CONTENT
}

async fn history_list_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    Json(state.history.rollback_targets())
}

async fn history_record_handler(
    State(state): State<Arc<HttpState>>,
    Json(version): Json<DeploymentVersion>,
) -> StatusCode {
    state.history.record_deployment(version);
    StatusCode::CREATED
}

fn ack(status: &RolloutStatus) -> RolloutAck {
    RolloutAck {
        name: status.name.clone(),
        phase: status.phase,
        weight: status.current_weight,
    }
}

/// Start the HTTP server.
///
/// # Arguments
/// * `port` - The port to listen on.
/// * `state` - Shared state for handlers.
///
/// # Returns
/// A handle to the spawned server task.
pub async fn start_server(
    port: u16,
    state: HttpState,
) -> tokio::task::JoinHandle<Result<(), std::io::Error>> {
    let router = create_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!("Starting HTTP server on port {}", port);

    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await
    })
}
