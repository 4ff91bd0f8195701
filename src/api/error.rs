//! Unified API error handling.
//!
//! All errors are returned in a standard JSON envelope matching
//! `{success: false, error: {code, message, details?}}` with an appropriate
//! HTTP status code.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Error codes for API responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ValidationError,
    Unauthorized,
    Forbidden,
    QuotaExceeded,
    NotFound,
    Conflict,
    RuntimeError,
    ProvisionError,
    MigrationError,
    InternalError,
}

impl ErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::ValidationError => StatusCode::BAD_REQUEST,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::Forbidden | ErrorCode::QuotaExceeded => StatusCode::FORBIDDEN,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Conflict => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::RuntimeError | ErrorCode::ProvisionError | ErrorCode::MigrationError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "validation_error",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::Forbidden => "forbidden",
            ErrorCode::QuotaExceeded => "quota_exceeded",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Conflict => "conflict",
            ErrorCode::RuntimeError => "runtime_error",
            ErrorCode::ProvisionError => "provision_error",
            ErrorCode::MigrationError => "migration_error",
            ErrorCode::InternalError => "internal_error",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorDetails {
    ValidationErrors(HashMap<String, Vec<String>>),
    Generic(HashMap<String, serde_json::Value>),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: ErrorBody,
}

/// Unified API error type.
#[derive(Debug)]
pub struct ApiError {
    code: ErrorCode,
    status: StatusCode,
    message: String,
    details: Option<ErrorDetails>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code(),
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_validation_errors(mut self, errors: HashMap<String, Vec<String>>) -> Self {
        self.details = Some(ErrorDetails::ValidationErrors(errors));
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    pub fn validation_field(field: &str, message: impl Into<String>) -> Self {
        let mut errors = HashMap::new();
        errors.insert(field.to_string(), vec![message.into()]);
        Self::new(ErrorCode::ValidationError, "Validation failed").with_validation_errors(errors)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    pub fn quota_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::QuotaExceeded, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Conflict, message)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RuntimeError, message)
    }

    pub fn provision(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ProvisionError, message)
    }

    pub fn migration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::MigrationError, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let response = ErrorResponse {
            success: false,
            error: ErrorBody {
                code: self.code.as_str().to_string(),
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(response)).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for ApiError {}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Database error: {}", err);
        match &err {
            sqlx::Error::RowNotFound => ApiError::not_found("Resource not found"),
            sqlx::Error::Database(db_err) => {
                let msg = db_err.message();
                if msg.contains("UNIQUE constraint failed") {
                    ApiError::conflict("A resource with this identifier already exists")
                } else {
                    ApiError::internal("A database error occurred")
                }
            }
            _ => ApiError::internal("A database error occurred"),
        }
    }
}

/// Maps an orchestrator/quota/provisioner `anyhow::Error` to the error kind
/// its message was tagged with (e.g. `"ValidationError: ..."`), falling back
/// to `InternalError`.
impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        if err.downcast_ref::<crate::quota::QuotaExceeded>().is_some() {
            return ApiError::quota_exceeded(err.to_string());
        }

        let message = err.to_string();
        let code = if message.starts_with("ValidationError") {
            ErrorCode::ValidationError
        } else if message.starts_with("NotFound") {
            ErrorCode::NotFound
        } else if message.starts_with("ProvisionError") {
            ErrorCode::ProvisionError
        } else if message.starts_with("MigrationError") {
            ErrorCode::MigrationError
        } else if message.starts_with("RuntimeError") {
            ErrorCode::RuntimeError
        } else {
            ErrorCode::InternalError
        };
        ApiError::new(code, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_status_codes() {
        assert_eq!(ErrorCode::ValidationError.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorCode::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorCode::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::QuotaExceeded.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(ErrorCode::InternalError.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn anyhow_error_maps_by_message_prefix() {
        let err: ApiError = anyhow::anyhow!("ValidationError: missing field").into();
        assert_eq!(err.code, ErrorCode::ValidationError);

        let err: ApiError = anyhow::anyhow!("NotFound: no such preview").into();
        assert_eq!(err.code, ErrorCode::NotFound);

        let err: ApiError = anyhow::anyhow!("something unexpected").into();
        assert_eq!(err.code, ErrorCode::InternalError);
    }

    #[test]
    fn quota_exceeded_error_maps_to_quota_code() {
        let quota_err = crate::quota::QuotaExceeded {
            owner: "acme".to_string(),
            active: 10,
            max: 10,
        };
        let err: ApiError = anyhow::Error::new(quota_err).into();
        assert_eq!(err.code, ErrorCode::QuotaExceeded);
    }
}
