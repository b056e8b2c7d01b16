//! # Error Handling
//!
//! Two layers live here. [`SyncError`] is the domain error every pipeline
//! component returns; its [`ErrorClass`] drives retry, pause and failure
//! decisions. [`ApiError`] is the problem+json body returned over HTTP, with
//! trace ID propagation.

use axum::{
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

use crate::telemetry;

/// How the pipeline reacts to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry later, up to the attempt cap
    Transient,
    /// Stop the run and wake an operator
    Critical,
    /// Give up on the entity, keep the run going
    Permanent,
}

/// Domain error produced by stores, the vendor client and the worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncError {
    #[serde(flatten)]
    pub kind: SyncErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncErrorKind {
    /// Network hiccup, 5xx, timeout or unparseable response
    Transient,
    /// Vendor throttled us, with an optional retry hint
    RateLimited {
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_secs: Option<u64>,
    },
    /// Auth failure, bad credentials or a broken store
    Critical,
    /// Not found or rejected by validation
    Permanent,
    /// Caller supplied unusable arguments
    InvalidInput,
    /// Requested status change would move a run backwards
    InvalidTransition { from: String, to: String },
    /// Referenced run or batch does not exist
    NotFound,
}

impl SyncError {
    fn with_kind(kind: SyncErrorKind, message: Option<String>) -> Self {
        Self {
            kind,
            message,
            details: None,
        }
    }

    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self::with_kind(SyncErrorKind::Transient, Some(message.into()))
    }

    pub fn rate_limited(retry_after_secs: Option<u64>) -> Self {
        Self::with_kind(SyncErrorKind::RateLimited { retry_after_secs }, None)
    }

    pub fn rate_limited_with_message<S: Into<String>>(
        retry_after_secs: Option<u64>,
        message: S,
    ) -> Self {
        Self::with_kind(
            SyncErrorKind::RateLimited { retry_after_secs },
            Some(message.into()),
        )
    }

    pub fn critical<S: Into<String>>(message: S) -> Self {
        Self::with_kind(SyncErrorKind::Critical, Some(message.into()))
    }

    pub fn permanent<S: Into<String>>(message: S) -> Self {
        Self::with_kind(SyncErrorKind::Permanent, Some(message.into()))
    }

    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        Self::with_kind(SyncErrorKind::InvalidInput, Some(message.into()))
    }

    pub fn invalid_transition(from: &str, to: &str) -> Self {
        Self::with_kind(
            SyncErrorKind::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            },
            None,
        )
    }

    pub fn not_found<S: Into<String>>(message: S) -> Self {
        Self::with_kind(SyncErrorKind::NotFound, Some(message.into()))
    }

    /// Tracking or queue store failure. Always critical.
    pub fn storage(error: &sea_orm::DbErr) -> Self {
        Self::critical(format!("storage failure: {error}"))
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Retry hint carried by rate-limit errors.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self.kind {
            SyncErrorKind::RateLimited { retry_after_secs } => retry_after_secs,
            _ => None,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self.kind {
            SyncErrorKind::Transient | SyncErrorKind::RateLimited { .. } => ErrorClass::Transient,
            SyncErrorKind::Critical => ErrorClass::Critical,
            SyncErrorKind::Permanent
            | SyncErrorKind::InvalidInput
            | SyncErrorKind::InvalidTransition { .. }
            | SyncErrorKind::NotFound => ErrorClass::Permanent,
        }
    }
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            SyncErrorKind::Transient => write!(f, "Transient error")?,
            SyncErrorKind::RateLimited { retry_after_secs } => {
                write!(f, "Rate limited")?;
                if let Some(after) = retry_after_secs {
                    write!(f, " (retry after: {}s)", after)?;
                }
            }
            SyncErrorKind::Critical => write!(f, "Critical error")?,
            SyncErrorKind::Permanent => write!(f, "Permanent error")?,
            SyncErrorKind::InvalidInput => write!(f, "Invalid input")?,
            SyncErrorKind::InvalidTransition { from, to } => {
                write!(f, "Invalid run transition {} -> {}", from, to)?
            }
            SyncErrorKind::NotFound => write!(f, "Not found")?,
        }
        if let Some(msg) = &self.message {
            write!(f, ": {}", msg)?;
        }
        Ok(())
    }
}

impl std::error::Error for SyncError {}

impl From<sea_orm::DbErr> for SyncError {
    fn from(error: sea_orm::DbErr) -> Self {
        tracing::error!(error = %error, "Sync store operation failed");
        Self::storage(&error)
    }
}

impl From<crate::models::UnknownVariant> for SyncError {
    fn from(error: crate::models::UnknownVariant) -> Self {
        Self::critical(format!("corrupt stored value: {error}"))
    }
}

/// Unified API error response structure
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiError {
    /// HTTP status code for the response
    #[serde(skip_serializing, skip_deserializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    pub code: Box<str>,
    /// Human-readable error message
    pub message: Box<str>,
    /// Additional error details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Box<serde_json::Value>>,
    /// Suggested retry delay in seconds (optional)
    pub retry_after: Option<u64>,
    /// Correlation trace ID for debugging (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    /// Create a new API error with the given status code and message
    pub fn new<S: Into<String>>(status: StatusCode, code: S, message: S) -> Self {
        Self {
            status,
            code: code.into().into_boxed_str(),
            message: message.into().into_boxed_str(),
            details: None,
            retry_after: None,
            trace_id: Self::current_trace_id(),
        }
    }

    /// Add details to the error
    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    /// Set retry after delay
    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    fn current_trace_id() -> Option<Box<str>> {
        telemetry::current_trace_id()
            .map(|trace_id| trace_id.into_boxed_str())
            .or_else(|| Some(telemetry::correlation_id().into_boxed_str()))
    }
}

/// Standard error types with predefined status codes
#[derive(Debug, Error)]
pub enum ErrorType {
    #[error("Bad Request")]
    BadRequest,
    #[error("Forbidden")]
    Forbidden,
    #[error("Not Found")]
    NotFound,
    #[error("Conflict")]
    Conflict,
    #[error("Too Many Requests")]
    TooManyRequests,
    #[error("Internal Server Error")]
    InternalServerError,
    #[error("Service Unavailable")]
    ServiceUnavailable,
}

impl ErrorType {
    /// Get the appropriate HTTP status code for this error type
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorType::BadRequest => StatusCode::BAD_REQUEST,
            ErrorType::Forbidden => StatusCode::FORBIDDEN,
            ErrorType::NotFound => StatusCode::NOT_FOUND,
            ErrorType::Conflict => StatusCode::CONFLICT,
            ErrorType::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            ErrorType::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorType::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Get the error code string for this error type
    pub fn error_code(&self) -> &'static str {
        match self {
            ErrorType::BadRequest => "VALIDATION_FAILED",
            ErrorType::Forbidden => "FORBIDDEN",
            ErrorType::NotFound => "NOT_FOUND",
            ErrorType::Conflict => "CONFLICT",
            ErrorType::TooManyRequests => "RATE_LIMITED",
            ErrorType::InternalServerError => "INTERNAL_SERVER_ERROR",
            ErrorType::ServiceUnavailable => "SERVICE_UNAVAILABLE",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );

        if let Some(retry_after) = self.retry_after
            && let Ok(header_value) = HeaderValue::from_str(&retry_after.to_string())
        {
            headers.insert("retry-after", header_value);
        }

        (self.status, headers, axum::Json(self)).into_response()
    }
}

impl From<ErrorType> for ApiError {
    fn from(error_type: ErrorType) -> Self {
        Self::new(
            error_type.status_code(),
            error_type.error_code(),
            &error_type.to_string(),
        )
    }
}

impl From<SyncError> for ApiError {
    fn from(error: SyncError) -> Self {
        let message = error.to_string();
        let error_type = match &error.kind {
            SyncErrorKind::InvalidInput => ErrorType::BadRequest,
            SyncErrorKind::NotFound => ErrorType::NotFound,
            SyncErrorKind::InvalidTransition { .. } => ErrorType::Conflict,
            SyncErrorKind::RateLimited { retry_after_secs } => {
                let api_error = Self::new(
                    ErrorType::TooManyRequests.status_code(),
                    ErrorType::TooManyRequests.error_code(),
                    &message,
                );
                return match retry_after_secs {
                    Some(secs) => api_error.with_retry_after(*secs),
                    None => api_error,
                };
            }
            SyncErrorKind::Transient | SyncErrorKind::Critical => {
                tracing::error!(error = %error, "Sync pipeline unavailable");
                ErrorType::ServiceUnavailable
            }
            SyncErrorKind::Permanent => {
                return Self::new(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "UNPROCESSABLE_ENTITY",
                    &message,
                );
            }
        };

        Self::new(error_type.status_code(), error_type.error_code(), &message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_api_error_basic() {
        let error = ApiError::new(
            StatusCode::BAD_REQUEST,
            "VALIDATION_FAILED",
            "Test error message",
        );

        assert_eq!(error.code, Box::from("VALIDATION_FAILED"));
        assert_eq!(error.message, Box::from("Test error message"));
        assert_eq!(error.details, None);
        assert_eq!(error.retry_after, None);
        assert!(error.trace_id.is_some());
    }

    #[test]
    fn test_api_error_with_details() {
        let error = ApiError::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", "Test error message")
            .with_details(json!({"field": "value"}));

        assert_eq!(error.details, Some(Box::new(json!({"field": "value"}))));
    }

    #[test]
    fn test_sync_error_classes() {
        assert_eq!(SyncError::transient("net").class(), ErrorClass::Transient);
        assert_eq!(
            SyncError::rate_limited(Some(30)).class(),
            ErrorClass::Transient
        );
        assert_eq!(SyncError::critical("401").class(), ErrorClass::Critical);
        assert_eq!(SyncError::permanent("404").class(), ErrorClass::Permanent);
        assert_eq!(
            SyncError::storage(&sea_orm::DbErr::Custom("disk".into())).class(),
            ErrorClass::Critical
        );
    }

    #[test]
    fn test_sync_error_display() {
        let error = SyncError::rate_limited_with_message(Some(60), "slow down");
        assert_eq!(error.to_string(), "Rate limited (retry after: 60s): slow down");
        assert_eq!(error.retry_after_secs(), Some(60));

        let error = SyncError::invalid_transition("completed", "running");
        assert_eq!(
            error.to_string(),
            "Invalid run transition completed -> running"
        );
    }

    #[test]
    fn test_sync_error_serializes_with_type_tag() {
        let error = SyncError::rate_limited(Some(15)).with_details(json!({"status": 429}));
        let value = serde_json::to_value(&error).unwrap();
        assert_eq!(value["type"], "rate_limited");
        assert_eq!(value["retry_after_secs"], 15);
        assert_eq!(value["details"]["status"], 429);
    }

    #[test]
    fn test_sync_error_to_api_error() {
        let api: ApiError = SyncError::invalid_input("no ids").into();
        assert_eq!(api.status, StatusCode::BAD_REQUEST);
        assert_eq!(api.code, Box::from("VALIDATION_FAILED"));

        let api: ApiError = SyncError::invalid_transition("paused", "running").into();
        assert_eq!(api.status, StatusCode::CONFLICT);

        let api: ApiError = SyncError::rate_limited(Some(42)).into();
        assert_eq!(api.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(api.retry_after, Some(42));
    }
}
