// ============================================================================
// Messages Routes
// ============================================================================
//
// Endpoints:
// - POST /api/messages - Publish messages to both staging topics atomically
// - GET /api/messages/pod-number - Pod number of this instance
//
// ============================================================================

use axum::extract::rejection::JsonRejection;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::context::AppContext;
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishRequest {
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishResponse {
    pub success: bool,
    pub published_count: usize,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodNumberResponse {
    pub pod_number: u32,
}

/// POST /api/messages
/// Publishes every message to stagingA and stagingB in one transaction.
/// A message equal to "FAIL" rolls the whole request back.
pub async fn publish_messages(
    State(app_context): State<Arc<AppContext>>,
    request: Result<Json<PublishRequest>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let Json(request) = request.map_err(|rejection| AppError::validation(rejection.body_text()))?;

    info!(count = request.messages.len(), "Received request to publish messages");

    let receipt = app_context.publisher.publish(&request.messages).await?;

    Ok((
        StatusCode::OK,
        Json(PublishResponse {
            success: true,
            published_count: receipt.published_count,
            message: format!(
                "Successfully published {} messages to staging queues",
                receipt.published_count
            ),
        }),
    ))
}

/// GET /api/messages/pod-number
pub async fn pod_number(State(app_context): State<Arc<AppContext>>) -> impl IntoResponse {
    Json(PodNumberResponse {
        pod_number: app_context.config.pod_number,
    })
}
