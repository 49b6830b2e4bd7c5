//! Unified error handling for the server.
//!
//! Every failure is classified into one of the wire-visible kinds below;
//! handlers and the pipeline return [`AppError`] and axum renders it.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use haven_engine::ValidationErrors;
use serde::Serialize;
use serde_json::json;

use crate::store::StoreError;

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error("validation failed")]
    Validation(ValidationErrors),

    #[error("authentication required")]
    Unauthenticated,

    #[error("forbidden")]
    Forbidden,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// A script called `cancel(message, status)`.
    #[error("{message}")]
    Cancelled { message: String, status: u16 },

    #[error("script timed out")]
    ScriptTimeout,

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// The HTTP status this error surfaces as.
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthenticated => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Unsupported(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Cancelled { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_REQUEST)
            }
            AppError::ScriptTimeout => StatusCode::GATEWAY_TIMEOUT,
            AppError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<haven_engine::Error> for AppError {
    fn from(e: haven_engine::Error) -> Self {
        AppError::BadRequest(e.to_string())
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DuplicateId => AppError::Conflict("duplicate id".into()),
            StoreError::UniqueViolation(field) => {
                AppError::Conflict(format!("duplicate value for unique field '{field}'"))
            }
            StoreError::UnknownCollection(name) => {
                AppError::NotFound(format!("collection '{name}'"))
            }
            StoreError::Unavailable(msg) => AppError::StorageUnavailable(msg),
            StoreError::Query(e) => AppError::BadRequest(e.to_string()),
            StoreError::Backend(msg) => AppError::Internal(msg),
        }
    }
}

/// Error response body.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        if let AppError::Validation(errors) = &self {
            return (status, Json(json!({ "errors": errors }))).into_response();
        }

        match &self {
            AppError::Internal(msg) => tracing::error!("internal error: {msg}"),
            AppError::StorageUnavailable(msg) => tracing::error!("storage unavailable: {msg}"),
            AppError::ScriptTimeout => tracing::warn!("script invocation timed out"),
            // Script cancel and validation are expected flow control
            _ => {}
        }

        let message = match &self {
            // Never leak internals on the wire
            AppError::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

/// Result type alias for handlers.
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_match_the_error_kinds() {
        assert_eq!(
            AppError::BadRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(AppError::Unauthenticated.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AppError::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            AppError::NotFound("x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(AppError::Conflict("x".into()).status(), StatusCode::CONFLICT);
        assert_eq!(
            AppError::Unsupported("x".into()).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(AppError::ScriptTimeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            AppError::StorageUnavailable("x".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn cancelled_carries_its_status() {
        let err = AppError::Cancelled {
            message: "nope".into(),
            status: 418,
        };
        assert_eq!(err.status().as_u16(), 418);

        let err = AppError::Cancelled {
            message: "bad".into(),
            status: 1,
        };
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }
}
