use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::{cache::KvError, database::DatabaseError};

/// Top-level application error. Every layer-specific error converges here
/// before it crosses an HTTP boundary.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
    #[error("KV store error: {0}")]
    Kv(#[from] KvError),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("No active key available for group {0}")]
    NoActiveKey(String),
    #[error("No child group available for aggregate group {0}")]
    NoChildGroupAvailable(String),
    #[error("Model not allowed: {0}")]
    ModelNotAllowed(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::ModelNotAllowed(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) | AppError::NoChildGroupAvailable(_) => StatusCode::NOT_FOUND,
            AppError::NoActiveKey(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to hand to a client. Internal detail stays in the logs.
    fn public_message(&self) -> String {
        match self {
            AppError::Config(_) | AppError::Database(_) | AppError::Kv(_) | AppError::Internal(_) => {
                "internal server error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
        }
        let body = Json(json!({
            "code": status.as_u16(),
            "message": self.public_message(),
            "data": serde_json::Value::Null,
        }));
        (status, body).into_response()
    }
}

/// Classification of an upstream attempt, used by the proxy retry loop and
/// the key pool's failure accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network error, timeout, 408/429 or any 5xx. Retried, never counted
    /// against the key.
    Transient,
    /// 401/403 or a provider-level "invalid key". Retried on another key and
    /// counted toward the blacklist threshold.
    KeyAttributable,
    /// Any other 4xx (bad schema, unknown model). Relayed verbatim, not
    /// retried.
    Permanent,
}

impl FailureKind {
    pub fn is_attributable(self) -> bool {
        matches!(self, FailureKind::KeyAttributable)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::KeyAttributable => "key_attributable",
            FailureKind::Permanent => "permanent",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            AppError::Validation("bad".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::Unauthorized("no".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::NotFound("g".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::NoActiveKey("g".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::Internal("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_internal_detail_not_exposed() {
        let err = AppError::Internal("connection string with password".into());
        assert_eq!(err.public_message(), "internal server error");

        let err = AppError::NotFound("group g1".into());
        assert!(err.public_message().contains("g1"));
    }

    #[test]
    fn test_failure_kind() {
        assert!(FailureKind::KeyAttributable.is_attributable());
        assert!(!FailureKind::Transient.is_attributable());
        assert!(!FailureKind::Permanent.is_attributable());
    }
}
