use crate::hub::{ChannelIdError, HubError};
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use error_types::{error_codes, error_types as kinds, ErrorResponse};
use event_schema::SchemaError;
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("server start failure: {0}")]
    StartServer(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("channel mismatch: {0}")]
    ChannelMismatch(String),

    #[error("invalid event: {0}")]
    InvalidEvent(#[from] SchemaError),

    #[error("invalid channel: {0}")]
    InvalidChannel(#[from] ChannelIdError),

    #[error("unauthorized")]
    Unauthorized,

    #[error("Channel limit reached")]
    ChannelLimit,

    #[error("Channel at capacity")]
    ChannelFull,

    #[error("internal server error")]
    Internal,
}

impl From<HubError> for AppError {
    fn from(e: HubError) -> Self {
        match e {
            HubError::ChannelLimitReached { .. } => AppError::ChannelLimit,
            HubError::ChannelFull { .. } => AppError::ChannelFull,
            HubError::SessionRetired | HubError::Encode(_) => {
                tracing::error!(error = %e, "hub failure");
                AppError::Internal
            }
        }
    }
}

impl AppError {
    fn kind_and_code(&self) -> (&'static str, &'static str) {
        match self {
            AppError::Config(_) => (kinds::SERVER_ERROR, error_codes::CONFIG_ERROR),
            AppError::StartServer(_) | AppError::Internal => {
                (kinds::SERVER_ERROR, error_codes::INTERNAL_SERVER_ERROR)
            }
            AppError::BadRequest(_) => (kinds::VALIDATION_ERROR, error_codes::BAD_REQUEST),
            AppError::ChannelMismatch(_) => (kinds::VALIDATION_ERROR, error_codes::CHANNEL_MISMATCH),
            AppError::InvalidEvent(_) => (kinds::VALIDATION_ERROR, error_codes::SCHEMA_INVALID),
            AppError::InvalidChannel(_) => (kinds::VALIDATION_ERROR, error_codes::CHANNEL_INVALID),
            AppError::Unauthorized => (kinds::AUTHENTICATION_ERROR, error_codes::TOKEN_INVALID),
            AppError::ChannelLimit => (
                kinds::SERVICE_UNAVAILABLE_ERROR,
                error_codes::CHANNEL_LIMIT_REACHED,
            ),
            AppError::ChannelFull => (kinds::SERVICE_UNAVAILABLE_ERROR, error_codes::CHANNEL_FULL),
        }
    }

    pub fn to_response(&self) -> ErrorResponse {
        let status = self.status_code();
        let (error_type, code) = self.kind_and_code();
        ErrorResponse::new(
            status.canonical_reason().unwrap_or("Error"),
            &self.to_string(),
            status.as_u16(),
            error_type,
            code,
        )
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_)
            | AppError::ChannelMismatch(_)
            | AppError::InvalidEvent(_)
            | AppError::InvalidChannel(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::ChannelLimit | AppError::ChannelFull => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Config(_) | AppError::StartServer(_) | AppError::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(self.to_response())
    }
}
