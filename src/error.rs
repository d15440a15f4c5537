//! Typed errors for everything below the HTTP layer.  Handlers return
//! `CoreError` and the `IntoResponse` impl maps each kind onto its status
//! code and the single-line `{"error": ...}` body shape.  Token endpoints
//! use the OAuth error shape from `auth` instead.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Body parse failure, missing required field, unknown option.
    #[error("{0}")]
    MalformedRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    /// Upstream CDN refused the datafile, or a disabled feature.
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    /// Streaming prerequisite missing.
    #[error("{0}")]
    Unprocessable(String),
    #[error("sdk key failed validation")]
    ValidationFailure,
    /// Logged, never surfaced to clients; retried at the bus level.
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Internal(String),
}

impl CoreError {
    pub fn status(&self) -> StatusCode {
        match self {
            CoreError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            CoreError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            CoreError::Forbidden(_) => StatusCode::FORBIDDEN,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CoreError::ValidationFailure => StatusCode::BAD_REQUEST,
            // Transient faults should not normally reach a handler; if one
            // does, shield the caller with a 500.
            CoreError::Transient(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        CoreError::MalformedRequest(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        CoreError::Internal(msg.into())
    }
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = self.status();
        if matches!(self, CoreError::Internal(_) | CoreError::Transient(_)) {
            tracing::error!(error = %self, "request failed");
        }
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_match_error_kinds() {
        assert_eq!(
            CoreError::malformed("x").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            CoreError::Unauthorized("x".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            CoreError::Forbidden("x".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            CoreError::NotFound("x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            CoreError::Unprocessable("x".into()).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(CoreError::ValidationFailure.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            CoreError::internal("x").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
