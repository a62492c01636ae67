//! Error types for NutriSage services
//!
//! Provides:
//! - Distinct error types for each failure mode of the answer pipeline
//! - Transient/permanent classification used by the retry layer
//! - HTTP status code mapping
//! - Structured error responses

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ratelimit::QuotaScope;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Error codes for machine-readable error identification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors (1xxx)
    ValidationError,

    // Resource errors (4xxx)
    SessionNotFound,

    // Rate limiting (6xxx)
    QuotaExceeded,
    RateLimited,

    // Storage errors (7xxx)
    CounterStoreError,

    // External service errors (8xxx)
    UpstreamError,
    UpstreamTimeout,
    ModerationError,
    MemoryError,

    // Internal errors (9xxx)
    InternalError,
    ConfigurationError,
    SerializationError,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn as_code(&self) -> u16 {
        match self {
            ErrorCode::ValidationError => 1001,

            ErrorCode::SessionNotFound => 4005,

            ErrorCode::QuotaExceeded => 6001,
            ErrorCode::RateLimited => 6002,

            ErrorCode::CounterStoreError => 7001,

            ErrorCode::UpstreamError => 8001,
            ErrorCode::UpstreamTimeout => 8002,
            ErrorCode::ModerationError => 8005,
            ErrorCode::MemoryError => 8006,

            ErrorCode::InternalError => 9001,
            ErrorCode::ConfigurationError => 9002,
            ErrorCode::SerializationError => 9003,
        }
    }
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    // Validation errors
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    // Resource errors
    #[error("Session not found: {id}")]
    SessionNotFound { id: String },

    // Rate limiting
    #[error("Quota exceeded for the current {scope} window, retry in {retry_after_secs}s")]
    QuotaExceeded {
        scope: QuotaScope,
        retry_after_secs: u64,
    },

    #[error("Too many requests")]
    RateLimited,

    // Durable counter store
    #[error("Counter store error: {message}")]
    CounterStore { message: String },

    // External service errors
    #[error("Upstream {service} error: {message}")]
    Upstream { service: String, message: String },

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Moderation error: {message}")]
    Moderation { message: String },

    #[error("Memory store error: {message}")]
    Memory { message: String },

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    // Internal errors
    #[error("Internal server error: {message}")]
    Internal { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Shorthand for an upstream failure of a named collaborator
    pub fn upstream(service: impl Into<String>, message: impl Into<String>) -> Self {
        AppError::Upstream {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Validation { .. } => ErrorCode::ValidationError,
            AppError::SessionNotFound { .. } => ErrorCode::SessionNotFound,
            AppError::QuotaExceeded { .. } => ErrorCode::QuotaExceeded,
            AppError::RateLimited => ErrorCode::RateLimited,
            AppError::CounterStore { .. } => ErrorCode::CounterStoreError,
            AppError::Upstream { .. } => ErrorCode::UpstreamError,
            AppError::Timeout { .. } => ErrorCode::UpstreamTimeout,
            AppError::Moderation { .. } => ErrorCode::ModerationError,
            AppError::Memory { .. } => ErrorCode::MemoryError,
            AppError::HttpClient(_) => ErrorCode::UpstreamError,
            AppError::Internal { .. } => ErrorCode::InternalError,
            AppError::Configuration { .. } => ErrorCode::ConfigurationError,
            AppError::Serialization(_) => ErrorCode::SerializationError,
            AppError::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            AppError::Validation { .. } => StatusCode::BAD_REQUEST,

            // 404 Not Found
            AppError::SessionNotFound { .. } => StatusCode::NOT_FOUND,

            // 429 Too Many Requests
            AppError::QuotaExceeded { .. } | AppError::RateLimited => {
                StatusCode::TOO_MANY_REQUESTS
            }

            // 500 Internal Server Error
            AppError::Internal { .. }
            | AppError::Configuration { .. }
            | AppError::Serialization(_)
            | AppError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,

            // 502 Bad Gateway
            AppError::Upstream { .. }
            | AppError::HttpClient(_)
            | AppError::Moderation { .. }
            | AppError::Memory { .. } => StatusCode::BAD_GATEWAY,

            // 504 Gateway Timeout
            AppError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,

            // 503 Service Unavailable
            AppError::CounterStore { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Whether a retry of the same call could succeed
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Timeout { .. } | AppError::Upstream { .. } => true,
            AppError::HttpClient(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().map_or(true, |s| s.is_server_error() || s.as_u16() == 429)
            }
            _ => false,
        }
    }

    /// Check if this error should be logged at error level
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// Check if this error is a client error
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }
}

/// Structured error response for API
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();
        let message = self.to_string();

        // Log based on severity
        if self.is_server_error() {
            tracing::error!(
                error = %message,
                code = ?code,
                status = status.as_u16(),
                "Server error"
            );
        } else if self.is_client_error() {
            tracing::warn!(
                error = %message,
                code = ?code,
                status = status.as_u16(),
                "Client error"
            );
        }

        let (details, retry_after) = match &self {
            AppError::QuotaExceeded {
                scope,
                retry_after_secs,
            } => (
                Some(serde_json::json!({
                    "scope": scope,
                    "retry_after_secs": retry_after_secs,
                })),
                Some(*retry_after_secs),
            ),
            _ => (None, None),
        };

        let body = ErrorResponse {
            error: ErrorDetails {
                code,
                message,
                details,
            },
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal {
            message: err.to_string(),
        }
    }
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        AppError::CounterStore {
            message: err.to_string(),
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Configuration {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        let err = AppError::SessionNotFound { id: "test".into() };
        assert_eq!(err.code(), ErrorCode::SessionNotFound);
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_error_codes_are_distinct() {
        let codes = [
            ErrorCode::ValidationError,
            ErrorCode::SessionNotFound,
            ErrorCode::QuotaExceeded,
            ErrorCode::RateLimited,
            ErrorCode::CounterStoreError,
            ErrorCode::UpstreamError,
            ErrorCode::UpstreamTimeout,
            ErrorCode::ModerationError,
            ErrorCode::MemoryError,
            ErrorCode::InternalError,
            ErrorCode::ConfigurationError,
            ErrorCode::SerializationError,
        ];
        let numeric: std::collections::HashSet<u16> = codes.iter().map(ErrorCode::as_code).collect();
        assert_eq!(numeric.len(), codes.len());
    }

    #[test]
    fn test_quota_exceeded_is_client_error() {
        let err = AppError::QuotaExceeded {
            scope: QuotaScope::Hour,
            retry_after_secs: 120,
        };
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert!(err.is_client_error());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_quota_response_carries_retry_after() {
        let response = AppError::QuotaExceeded {
            scope: QuotaScope::Day,
            retry_after_secs: 3600,
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            "3600"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(AppError::Timeout {
            operation: "retrieval".into(),
            timeout_ms: 100
        }
        .is_transient());
        assert!(AppError::upstream("llm", "503").is_transient());
        assert!(!AppError::Configuration {
            message: "bad".into()
        }
        .is_transient());
    }

    #[test]
    fn test_counter_store_is_fatal() {
        let err = AppError::CounterStore {
            message: "unreachable".into(),
        };
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(err.is_server_error());
        assert!(!err.is_transient());
    }
}
