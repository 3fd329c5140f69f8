//! HTTP surface: the WebSocket endpoint plus health and metrics routes.

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;

use liftoff_gateway::Gateway;
use liftoff_health::{HealthSupervisor, ProbeStatus};
use liftoff_metrics::MetricsFacade;

#[derive(Clone)]
pub struct AppState {
    pub supervisor: HealthSupervisor,
    pub metrics: MetricsFacade,
}

/// Assemble the daemon router: `/ws` (gateway), `/healthz`, `/readyz`,
/// `/livez`, and `/metrics`.
pub fn build_router(gateway: &Gateway, supervisor: HealthSupervisor, metrics: MetricsFacade) -> Router {
    let state = AppState {
        supervisor,
        metrics,
    };
    let ops = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/livez", get(livez))
        .route("/metrics", get(prometheus))
        .with_state(state);

    gateway.router().merge(ops)
}

/// GET /healthz — full report; 503 only when overall is unhealthy.
async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.supervisor.report().await;
    let status = if report.overall == ProbeStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, axum::Json(report))
}

/// GET /readyz — gates on critical probes.
async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    if state.supervisor.readiness().await {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

/// GET /livez — always alive.
async fn livez(State(state): State<AppState>) -> impl IntoResponse {
    let _ = state.supervisor.liveness();
    (StatusCode::OK, "alive")
}

/// GET /metrics — Prometheus text exposition.
async fn prometheus(State(state): State<AppState>) -> impl IntoResponse {
    let body = liftoff_metrics::render_prometheus(&state.metrics);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
