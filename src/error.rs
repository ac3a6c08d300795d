use axum::response::{IntoResponse, Response};
use http::StatusCode;
use thiserror::Error;

use crate::models::compliance::RiskLevel;
use crate::models::protocol::codes;

/// The application's error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// An authentication error.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The caller is not allowed to perform the operation.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// A transport or coordination store is unreachable.
    #[error("Network unavailable: {0}")]
    Network(String),

    /// A Redis error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// An I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A validation error.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The request conflicts with current state (e.g. already pairing).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A resource not found error.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// A time-bounded resource is past its lifetime.
    #[error("Expired: {0}")]
    Expired(String),

    /// The relayed data was rejected by compliance policy.
    #[error("Compliance violation: {reason}")]
    Compliance {
        reason: String,
        risk_level: RiskLevel,
        rule_id: String,
    },

    /// A cryptographic failure. Irrecoverable for the frame it occurred on.
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// A (de)serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An internal server error.
    #[error("Internal server error: {0}")]
    Internal(String),
}

/// A `Result` type that uses `AppError` as the error type.
pub type Result<T> = std::result::Result<T, AppError>;

/// The bounded taxonomy every outward-facing failure is reported under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Authentication,
    Permission,
    Network,
    Validation,
    Conflict,
    Internal,
    Compliance,
    Crypto,
}

impl ErrorCategory {
    /// Protocol error code sent to websocket clients.
    pub fn code(self) -> u32 {
        match self {
            ErrorCategory::Authentication => codes::AUTH_FAILED,
            ErrorCategory::Permission => codes::PERMISSION_DENIED,
            ErrorCategory::Network => codes::SERVICE_UNAVAILABLE,
            ErrorCategory::Validation => codes::BAD_REQUEST,
            ErrorCategory::Conflict => codes::CONFLICT,
            ErrorCategory::Internal => codes::INTERNAL_ERROR,
            ErrorCategory::Compliance => codes::COMPLIANCE_REJECTED,
            ErrorCategory::Crypto => codes::INTERNAL_ERROR,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::Permission => "permission",
            ErrorCategory::Network => "network",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Conflict => "conflict",
            ErrorCategory::Internal => "internal",
            ErrorCategory::Compliance => "compliance",
            ErrorCategory::Crypto => "crypto",
        }
    }
}

impl AppError {
    /// Maps the variant onto the error taxonomy.
    pub fn category(&self) -> ErrorCategory {
        match self {
            AppError::Authentication(_) => ErrorCategory::Authentication,
            AppError::PermissionDenied(_) => ErrorCategory::Permission,
            AppError::Network(_) | AppError::Redis(_) => ErrorCategory::Network,
            AppError::Validation(_) | AppError::NotFound(_) => ErrorCategory::Validation,
            AppError::Conflict(_) => ErrorCategory::Conflict,
            AppError::Compliance { .. } => ErrorCategory::Compliance,
            AppError::Crypto(_) => ErrorCategory::Crypto,
            AppError::Expired(_)
            | AppError::Io(_)
            | AppError::Serialization(_)
            | AppError::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Protocol error code for this error.
    pub fn code(&self) -> u32 {
        match self {
            AppError::NotFound(_) => codes::NOT_FOUND,
            AppError::Expired(_) => codes::NOT_FOUND,
            other => other.category().code(),
        }
    }
}

impl From<sonic_rs::Error> for AppError {
    fn from(e: sonic_rs::Error) -> Self {
        AppError::Serialization(e.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::Authentication(ref msg) => {
                tracing::warn!("Authentication failed: {}", msg);
                (StatusCode::UNAUTHORIZED, "Authentication failed".to_string())
            }

            AppError::PermissionDenied(ref msg) => {
                tracing::warn!("Permission denied: {}", msg);
                (StatusCode::FORBIDDEN, "Forbidden".to_string())
            }

            AppError::Network(ref msg) => {
                tracing::error!("Network unavailable: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, "Service temporarily unavailable".to_string())
            }

            AppError::Redis(ref e) => {
                tracing::error!("Redis error: {}", e);
                (StatusCode::SERVICE_UNAVAILABLE, "Coordination store error".to_string())
            }

            AppError::Io(ref e) => {
                tracing::error!("IO error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }

            AppError::Validation(ref msg) => {
                tracing::debug!("Validation error: {}", msg);
                (StatusCode::BAD_REQUEST, msg.clone())
            }

            AppError::Conflict(ref msg) => {
                tracing::debug!("Conflict: {}", msg);
                (StatusCode::CONFLICT, msg.clone())
            }

            AppError::NotFound(ref msg) => {
                tracing::debug!("Resource not found: {}", msg);
                (StatusCode::NOT_FOUND, "Resource not found".to_string())
            }

            AppError::Expired(ref msg) => {
                tracing::debug!("Expired: {}", msg);
                (StatusCode::GONE, "Resource expired".to_string())
            }

            AppError::Compliance { ref reason, risk_level, .. } => {
                tracing::warn!(?risk_level, "Compliance violation: {}", reason);
                (StatusCode::UNPROCESSABLE_ENTITY, "Rejected by compliance policy".to_string())
            }

            AppError::Crypto(ref msg) => {
                tracing::error!("Crypto error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Encryption error".to_string())
            }

            AppError::Serialization(ref msg) => {
                tracing::debug!("Serialization error: {}", msg);
                (StatusCode::BAD_REQUEST, "Malformed payload".to_string())
            }

            AppError::Internal(ref msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = sonic_rs::to_string(&sonic_rs::json!({
            "error": message
        }))
        .unwrap_or_else(|_| r#"{"error":"Internal server error"}"#.to_string());

        (status, body).into_response()
    }
}
