use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    #[serde(alias = "UNAUTHORIZED")]
    Unauthorized,
    #[serde(alias = "FORBIDDEN", alias = "permission_denied")]
    Forbidden,
    #[serde(alias = "NOT_FOUND")]
    NotFound,
    #[serde(
        alias = "BAD_REQUEST",
        alias = "invalid_format",
        alias = "invalid_type"
    )]
    Validation,
    RateLimited,
    #[serde(
        alias = "SERVER_ERROR",
        alias = "server_error",
        alias = "INTERNAL_ERROR",
        alias = "SERVICE_UNAVAILABLE"
    )]
    Internal,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[error("{code:?}: {message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Error body returned by the REST gateway: `{"success":false,"error":{...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    #[serde(default)]
    pub success: bool,
    pub error: ApiError,
}

/// Input rejected locally before any network call is issued.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("malformed {kind} id: {value:?}")]
    MalformedId { kind: &'static str, value: String },
    #[error("message content is empty")]
    EmptyContent,
    #[error("message content is {actual} bytes; the limit is {limit}")]
    ContentTooLong { actual: usize, limit: usize },
    #[error("{kind} envelope is missing a message id")]
    MissingMessageId { kind: &'static str },
    #[error("message {0} was not sent by the current user")]
    NotOwnMessage(String),
}
