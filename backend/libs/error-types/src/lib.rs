use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse service-level error shared by HTTP handlers
///
/// Services map their own error enums onto this one when they need the
/// standard status/code/type triple for an [`ErrorResponse`].
///
/// ```ignore
/// let body = ServiceError::ServiceUnavailable("Channel limit reached".into()).to_response();
/// assert_eq!(body.status, 503);
/// ```
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal server error: {0}")]
    InternalError(String),
}

impl ServiceError {
    pub fn status_code(&self) -> u16 {
        match self {
            ServiceError::NotFound(_) => 404,
            ServiceError::Unauthorized => 401,
            ServiceError::ValidationError(_) | ServiceError::BadRequest(_) => 400,
            ServiceError::RateLimited => 429,
            ServiceError::ServiceUnavailable(_) => 503,
            ServiceError::InternalError(_) => 500,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ServiceError::NotFound(_) => error_codes::CHANNEL_NOT_FOUND,
            ServiceError::Unauthorized => error_codes::TOKEN_INVALID,
            ServiceError::ValidationError(_) => error_codes::SCHEMA_INVALID,
            ServiceError::BadRequest(_) => error_codes::BAD_REQUEST,
            ServiceError::RateLimited => error_codes::RATE_LIMIT_ERROR,
            ServiceError::ServiceUnavailable(_) => error_codes::SERVICE_UNAVAILABLE,
            ServiceError::InternalError(_) => error_codes::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            ServiceError::NotFound(_) => error_types::NOT_FOUND_ERROR,
            ServiceError::Unauthorized => error_types::AUTHENTICATION_ERROR,
            ServiceError::ValidationError(_) | ServiceError::BadRequest(_) => {
                error_types::VALIDATION_ERROR
            }
            ServiceError::RateLimited => error_types::RATE_LIMIT_ERROR,
            ServiceError::ServiceUnavailable(_) => error_types::SERVICE_UNAVAILABLE_ERROR,
            ServiceError::InternalError(_) => error_types::SERVER_ERROR,
        }
    }

    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse::new(
            reason_phrase(self.status_code()),
            &self.to_string(),
            self.status_code(),
            self.error_type(),
            self.error_code(),
        )
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        429 => "Too Many Requests",
        503 => "Service Unavailable",
        _ => "Internal Server Error",
    }
}

/// Uniform JSON error body returned by every endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Short reason phrase
    pub error: String,

    /// Human readable explanation
    pub message: String,

    /// HTTP status code
    pub status: u16,

    /// Error family, one of [`error_types`]
    pub error_type: String,

    /// Stable machine code, one of [`error_codes`]
    pub code: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,

    /// Request trace id for log correlation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,

    /// RFC 3339 timestamp
    pub timestamp: String,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, status: u16, error_type: &str, code: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            status,
            error_type: error_type.to_string(),
            code: code.to_string(),
            details: None,
            trace_id: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn with_details(mut self, details: String) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_trace_id(mut self, trace_id: String) -> Self {
        self.trace_id = Some(trace_id);
        self
    }
}

/// Stable error codes
pub mod error_codes {
    // Channels
    pub const CHANNEL_NOT_FOUND: &str = "CHANNEL_NOT_FOUND";
    pub const CHANNEL_INVALID: &str = "CHANNEL_INVALID";
    pub const CHANNEL_MISMATCH: &str = "CHANNEL_MISMATCH";
    pub const CHANNEL_LIMIT_REACHED: &str = "CHANNEL_LIMIT_REACHED";
    pub const CHANNEL_FULL: &str = "CHANNEL_FULL";

    // Messages
    pub const SCHEMA_INVALID: &str = "SCHEMA_INVALID";
    pub const BAD_REQUEST: &str = "BAD_REQUEST";

    // Authentication
    pub const TOKEN_INVALID: &str = "TOKEN_INVALID";

    // System
    pub const CONFIG_ERROR: &str = "CONFIG_ERROR";
    pub const INTERNAL_SERVER_ERROR: &str = "INTERNAL_SERVER_ERROR";
    pub const SERVICE_UNAVAILABLE: &str = "SERVICE_UNAVAILABLE";
    pub const RATE_LIMIT_ERROR: &str = "RATE_LIMIT_EXCEEDED";
}

/// Error families
pub mod error_types {
    pub const VALIDATION_ERROR: &str = "validation_error";
    pub const AUTHENTICATION_ERROR: &str = "authentication_error";
    pub const NOT_FOUND_ERROR: &str = "not_found_error";
    pub const RATE_LIMIT_ERROR: &str = "rate_limit_error";
    pub const SERVER_ERROR: &str = "server_error";
    pub const SERVICE_UNAVAILABLE_ERROR: &str = "service_unavailable_error";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_creation() {
        let error = ErrorResponse::new(
            "Service Unavailable",
            "Channel limit reached",
            503,
            error_types::SERVICE_UNAVAILABLE_ERROR,
            error_codes::CHANNEL_LIMIT_REACHED,
        );

        assert_eq!(error.status, 503);
        assert_eq!(error.error_type, error_types::SERVICE_UNAVAILABLE_ERROR);
        assert_eq!(error.code, error_codes::CHANNEL_LIMIT_REACHED);
    }

    #[test]
    fn test_optional_fields_are_omitted() {
        let body = ServiceError::BadRequest("campaignId mismatch".into()).to_response();
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["status"], 400);
        assert!(json.get("details").is_none());
        assert!(json.get("trace_id").is_none());

        let traced = body.with_trace_id("t-1".into());
        assert_eq!(serde_json::to_value(&traced).unwrap()["trace_id"], "t-1");
    }

    #[test]
    fn test_service_error_mapping() {
        assert_eq!(ServiceError::RateLimited.status_code(), 429);
        assert_eq!(ServiceError::Unauthorized.error_code(), error_codes::TOKEN_INVALID);
        assert_eq!(
            ServiceError::ServiceUnavailable("x".into()).error_type(),
            error_types::SERVICE_UNAVAILABLE_ERROR
        );
    }
}
