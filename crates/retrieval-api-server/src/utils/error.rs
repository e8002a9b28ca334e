use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Bad input: {0}")]
    BadInput(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Bad query: {0}")]
    BadQuery(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Embedder unavailable: {0}")]
    EmbedderUnavailable(String),

    #[error("Embedder protocol error: {0}")]
    EmbedderProtocol(String),

    #[error("LLM unavailable: {0}")]
    LlmUnavailable(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Tool input rejected: {0}")]
    ToolInputRejected(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Transient failures that a top-level batch runner may retry.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ApiError::StoreUnavailable(_) | ApiError::EmbedderUnavailable(_)
        )
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() || db.is_foreign_key_violation() => {
                ApiError::ConstraintViolation(db.to_string())
            }
            sqlx::Error::Database(db) => ApiError::BadQuery(db.to_string()),
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_) => ApiError::StoreUnavailable(err.to_string()),
            sqlx::Error::RowNotFound | sqlx::Error::ColumnNotFound(_) => {
                ApiError::BadQuery(err.to_string())
            }
            _ => ApiError::StoreUnavailable(err.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Internal detail stays in the logs; the wire gets a generic message.
        let (status, error_type, message) = match &self {
            ApiError::BadInput(msg) => {
                tracing::warn!("Bad input: {}", msg);
                (StatusCode::BAD_REQUEST, "BadInput", msg.clone())
            }
            ApiError::ToolInputRejected(msg) => {
                tracing::warn!("Tool input rejected: {}", msg);
                (StatusCode::BAD_REQUEST, "BadInput", msg.clone())
            }
            ApiError::Timeout => {
                tracing::warn!("Request timed out");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Timeout",
                    "request timed out".to_string(),
                )
            }
            other => {
                tracing::error!("Request failed: {}", other);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "InternalError",
                    "internal server error".to_string(),
                )
            }
        };

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_kinds() {
        assert!(ApiError::StoreUnavailable("conn reset".into()).is_retriable());
        assert!(ApiError::EmbedderUnavailable("503".into()).is_retriable());
        assert!(!ApiError::BadInput("nope".into()).is_retriable());
        assert!(!ApiError::Timeout.is_retriable());
    }

    #[test]
    fn pool_errors_map_to_store_unavailable() {
        let err: ApiError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, ApiError::StoreUnavailable(_)));
    }
}
