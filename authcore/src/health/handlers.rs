use axum::{Json, extract::State, http::StatusCode};

use crate::AppState;
use crate::health::HealthReport;

/// Liveness probe
#[utoipa::path(
    get,
    path = "/health/live",
    tag = "health",
    responses(
        (status = 200, description = "Process is alive", body = HealthReport),
        (status = 503, description = "Process is shutting down", body = HealthReport),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn liveness(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let report = state.health.liveness();
    (report.status.status_code(), Json(report))
}

/// Readiness probe
#[utoipa::path(
    get,
    path = "/health/ready",
    tag = "health",
    responses(
        (status = 200, description = "Ready, possibly degraded", body = HealthReport),
        (status = 503, description = "Critical dependency down or shutting down", body = HealthReport),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn readiness(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let report = state.health.readiness().await;
    (report.status.status_code(), Json(report))
}
