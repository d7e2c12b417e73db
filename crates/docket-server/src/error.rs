//! Server-specific error types

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::api::response::ErrorResponse;

/// Result type alias for audit operations
pub type AuditResult<T> = std::result::Result<T, AuditError>;

/// What a chain verification found wrong with a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// Stored hash no longer matches the record's content
    HashMismatch,
    /// `previous_hash` does not point at the preceding record
    ChainBreak,
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationKind::HashMismatch => write!(f, "hash_mismatch"),
            ViolationKind::ChainBreak => write!(f, "chain_break"),
        }
    }
}

/// Errors raised by the audit subsystem
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Storage operation timed out after {0:?}")]
    StorageTimeout(Duration),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Circuit breaker is open")]
    BreakerOpen,

    #[error("Audit queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Chain integrity violation at record {record_id}: {kind}")]
    ChainIntegrityViolation { record_id: Uuid, kind: ViolationKind },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<docket_common::DocketError> for AuditError {
    fn from(err: docket_common::DocketError) -> Self {
        match err {
            docket_common::DocketError::InvalidIdentifier(msg) => AuditError::Validation(msg),
            docket_common::DocketError::Config(msg) => AuditError::Configuration(msg),
            docket_common::DocketError::Serialization(e) => AuditError::Serialization(e),
            other => AuditError::StorageUnavailable(other.to_string()),
        }
    }
}

/// Application error type that can be converted to HTTP responses
#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            },
            AppError::Audit(err) => match err {
                AuditError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg),
                AuditError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
                AuditError::StorageTimeout(_)
                | AuditError::StorageUnavailable(_)
                | AuditError::BreakerOpen
                | AuditError::QueueUnavailable(_) => {
                    tracing::warn!(error = %err, "Audit storage unavailable");
                    (
                        StatusCode::SERVICE_UNAVAILABLE,
                        "STORAGE_UNAVAILABLE",
                        "Audit storage is temporarily unavailable".to_string(),
                    )
                },
                AuditError::Database(ref e) => {
                    tracing::error!(error = %e, "Database error");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "INTERNAL_ERROR",
                        "A database error occurred".to_string(),
                    )
                },
                other => {
                    tracing::error!(error = %other, "Audit error");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "INTERNAL_ERROR",
                        "An internal error occurred".to_string(),
                    )
                },
            },
        };

        (status, Json(ErrorResponse::new(code, message))).into_response()
    }
}

/// Alias for handler results
pub type ApiResult<T> = Result<T, AppError>;
