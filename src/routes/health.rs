// ============================================================================
// Health and Metrics Routes
// ============================================================================
//
// Endpoints:
// - GET /health - Overall status (publisher ready, relays running)
// - GET /health/live - Process is up
// - GET /health/ready - Started and no relay has stopped
// - GET /metrics - Prometheus metrics
//
// ============================================================================

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde_json::json;
use std::sync::Arc;

use crate::context::AppContext;
use crate::metrics;

/// GET /health
pub async fn health_check(State(app_context): State<Arc<AppContext>>) -> impl IntoResponse {
    let (status, label) = if !app_context.relays_healthy() {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    } else if app_context.is_ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "starting")
    };

    (
        status,
        Json(json!({
            "status": label,
            "service": "courier",
            "podNumber": app_context.config.pod_number,
            "kafkaEnabled": app_context.config.kafka.enabled,
        })),
    )
}

/// GET /health/live
pub async fn liveness() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "ok"})))
}

/// GET /health/ready
/// 503 before startup finished, during shutdown and after any relay stopped
pub async fn readiness(State(app_context): State<Arc<AppContext>>) -> impl IntoResponse {
    if app_context.is_ready() {
        (StatusCode::OK, Json(json!({"status": "ready"})))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "not_ready"})),
        )
    }
}

/// GET /metrics
/// Prometheus metrics endpoint
pub async fn metrics() -> impl IntoResponse {
    match metrics::gather_metrics() {
        Ok(metrics_data) => (
            StatusCode::OK,
            [("Content-Type", "text/plain; version=0.0.4")],
            metrics_data,
        ),
        Err(e) => {
            tracing::error!("Failed to gather metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("Content-Type", "text/plain")],
                "Internal Server Error".to_string(),
            )
        }
    }
}
