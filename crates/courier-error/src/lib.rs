use axum::{http::StatusCode, response::IntoResponse};
use serde_json::json;
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

/// Application error type for the HTTP surface
///
/// Every variant maps to a status code, a stable machine-readable code and a
/// user-facing message that never leaks broker internals.
#[derive(Error, Debug)]
pub enum AppError {
    // ===== Publish Errors =====
    /// The caller supplied the rollback sentinel; nothing was published.
    #[error("Transaction rolled back: {0}")]
    Rollback(String),

    // ===== Message Queue & Kafka Errors =====
    #[error("Kafka error: {0}")]
    Kafka(String),

    // ===== Validation Errors =====
    #[error("Validation error: {0}")]
    Validation(String),

    // ===== Internal Server Errors =====
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Rollback(_) | AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Kafka(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get a user-friendly error message (without sensitive details)
    pub fn user_message(&self) -> String {
        match self {
            AppError::Rollback(msg) => format!("Transaction rolled back: {}", msg),
            AppError::Validation(msg) => format!("Validation error: {}", msg),
            AppError::Kafka(_) => {
                "Transaction rolled back: message broker unavailable".to_string()
            }
            AppError::Internal(_) => "Internal server error".to_string(),
        }
    }

    /// Get error code for programmatic error handling
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Rollback(_) => "ROLLBACK",
            AppError::Kafka(_) => "KAFKA_ERROR",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Log this error with appropriate level and context
    pub fn log(&self) {
        let status = self.status_code();
        let code = self.error_code();

        if status.is_server_error() {
            tracing::error!(
                error = %self,
                error_code = %code,
                status = %status.as_u16(),
                "Server error occurred"
            );
        } else {
            tracing::warn!(
                error = %self,
                error_code = %code,
                status = %status.as_u16(),
                "Request rejected"
            );
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        self.log();

        let status = self.status_code();
        let user_message = self.user_message();

        // Same envelope as a successful publish so callers parse one shape
        let response_body = json!({
            "success": false,
            "publishedCount": 0,
            "message": user_message,
            "errorMessage": user_message,
            "errorCode": self.error_code(),
        });

        (status, axum::Json(response_body)).into_response()
    }
}

// ============================================================================
// Helper functions for creating common errors
// ============================================================================

impl AppError {
    /// Create a rollback error
    pub fn rollback(msg: impl Into<String>) -> Self {
        AppError::Rollback(msg.into())
    }

    /// Create a Kafka error
    pub fn kafka(msg: impl Into<String>) -> Self {
        AppError::Kafka(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        AppError::Validation(msg.into())
    }

    /// Create an internal server error
    pub fn internal(msg: impl Into<String>) -> Self {
        AppError::Internal(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[test]
    fn test_rollback_is_a_client_error() {
        let err = AppError::rollback("Encountered 'FAIL' message");
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.error_code(), "ROLLBACK");
        assert!(err.user_message().contains("FAIL"));
    }

    #[test]
    fn test_kafka_error_hides_details() {
        let err = AppError::kafka("Local: Broker transport failure (broker-1:9092)");
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(!err.user_message().contains("broker-1"));
    }

    #[test]
    fn test_internal_error_hides_details() {
        let err = AppError::internal("key must be a string at line 1 column 2");
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.error_code(), "INTERNAL_ERROR");
        assert_eq!(err.user_message(), "Internal server error");
    }

    #[tokio::test]
    async fn test_response_body_shape() {
        let response = AppError::rollback("sentinel").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["publishedCount"], 0);
        assert_eq!(json["errorCode"], "ROLLBACK");
    }
}
