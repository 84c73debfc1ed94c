//! Error types and JSON error responses for the control plane API

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::CONTENT_TYPE;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::io;
use thiserror::Error;

/// Failures of registry and lifecycle operations
#[derive(Debug, Error)]
pub enum BackendError {
    /// Malformed input field
    #[error("{0}")]
    Validation(String),
    /// Missing backend, template or user
    #[error("{0}")]
    NotFound(String),
    /// Identity clash in the registry (e.g. several files for one id)
    #[error("{0}")]
    Conflict(String),
    /// Every suffix for the prefix is taken
    #[error("reached max index number for location key prefix '{prefix}' (limit={limit})")]
    RegistryFull { prefix: String, limit: u16 },
    /// A stored record cannot be turned back into a create request
    #[error("{0}")]
    InvalidState(String),
    /// Template rendering failed or produced nothing
    #[error("{0}")]
    Template(String),
    /// Operation could not complete (e.g. duplicate cleanup failed)
    #[error("{0}")]
    Internal(String),
    /// Filesystem failure
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl BackendError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// API error code this failure is reported with
    pub fn code(&self) -> ErrorCode {
        match self {
            BackendError::Validation(_) => ErrorCode::InvalidRequest,
            BackendError::NotFound(_) => ErrorCode::NotFound,
            BackendError::Conflict(_) => ErrorCode::Conflict,
            BackendError::RegistryFull { .. } => ErrorCode::RegistryFull,
            BackendError::InvalidState(_) => ErrorCode::InvalidState,
            BackendError::Template(_) => ErrorCode::TemplateError,
            BackendError::Internal(_) | BackendError::Io { .. } => ErrorCode::InternalError,
        }
    }

    pub fn into_response(self) -> Response<Full<Bytes>> {
        json_error_response(self.code(), self.to_string())
    }
}

/// Error codes for API errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Request body or path parameter is malformed
    InvalidRequest,
    /// Missing or wrong API key
    Forbidden,
    /// Unknown route, backend, template or user
    NotFound,
    /// Identity clash in the registry
    Conflict,
    /// No suffix left for the requested prefix
    RegistryFull,
    /// Stored backend cannot be updated
    InvalidState,
    /// Template rendering failed
    TemplateError,
    /// Internal error
    InternalError,
}

impl ErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Conflict => StatusCode::CONFLICT,
            ErrorCode::RegistryFull => StatusCode::CONFLICT,
            ErrorCode::InvalidState => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::TemplateError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Error-Code header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::RegistryFull => "REGISTRY_FULL",
            ErrorCode::InvalidState => "INVALID_STATE",
            ErrorCode::TemplateError => "TEMPLATE_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Error-Code header
pub fn json_error_response(code: ErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let error = ErrorResponse::new(code, message);

    Response::builder()
        .status(code.status_code())
        .header(CONTENT_TYPE, "application/json")
        .header("X-Error-Code", code.as_header_value())
        .body(Full::new(Bytes::from(error.to_json())))
        .expect("valid response with StatusCode enum and static headers")
}
