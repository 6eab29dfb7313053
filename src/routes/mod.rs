// ============================================================================
// Axum Routes Module
// ============================================================================
//
// Structure:
// - mod.rs: Router assembly and middleware
// - messages.rs: Publish endpoint and pod number
// - health.rs: Health checks and Prometheus metrics
//
// ============================================================================

mod health;
mod messages;

pub use messages::{PodNumberResponse, PublishRequest, PublishResponse};

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::context::AppContext;

/// Create the application router
pub fn create_router(app_context: Arc<AppContext>) -> Router {
    Router::new()
        // Health and monitoring
        .route("/health", get(health::health_check))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .route("/metrics", get(health::metrics))
        // Publishing
        .route("/api/messages", post(messages::publish_messages))
        .route("/api/messages/pod-number", get(messages::pod_number))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .into_inner(),
        )
        .with_state(app_context)
}
