use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ThrottlerError {
    #[error("Redis error: {0}")]
    Redis(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Quota record for {identity} kept changing under concurrent writers")]
    Contention {
        identity: String,
        /// Reset time of the last window observed for the identity
        window_reset_at: DateTime<Utc>,
    },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ThrottlerError>;

impl From<redis::RedisError> for ThrottlerError {
    fn from(err: redis::RedisError) -> Self {
        ThrottlerError::Redis(err.to_string())
    }
}

impl From<validator::ValidationErrors> for ThrottlerError {
    fn from(err: validator::ValidationErrors) -> Self {
        ThrottlerError::Configuration(err.to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
        }
    }

    pub fn from_error(err: &ThrottlerError) -> Self {
        let message = err.to_string();
        match err {
            ThrottlerError::Redis(_) => Self::new("service_unavailable", &message, 503),
            ThrottlerError::Contention { .. } => Self::new("service_unavailable", &message, 503),
            ThrottlerError::Configuration(_) => Self::new("configuration_error", &message, 500),
            ThrottlerError::Internal(_) | ThrottlerError::Io(_) => {
                Self::new("internal_error", &message, 500)
            }
        }
    }
}

impl IntoResponse for ThrottlerError {
    fn into_response(self) -> Response {
        let body = ErrorResponse::from_error(&self);
        let status =
            StatusCode::from_u16(body.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_errors_map_to_503() {
        let body = ErrorResponse::from_error(&ThrottlerError::Redis("connection refused".into()));
        assert_eq!(body.code, 503);
        assert_eq!(body.error, "service_unavailable");
        assert!(body.message.contains("connection refused"));
    }

    #[test]
    fn test_into_response_uses_mapped_status() {
        let response = ThrottlerError::Configuration("bad window".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
