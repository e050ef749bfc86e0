use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    ConnectTimeout,
    ConnectFailed,
    AuthFailed,
    NegotiationFailed,
    BindFailed,
    ChannelFailed,
    ProtocolViolation,
    CommandFailed,
    IoError,
    RemoteClosed,
    Unsupported,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub error_code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiError {
    pub fn new(error_code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.details {
            Some(details) => write!(f, "{}: {} ({details})", self.error_code, self.message),
            None => write!(f, "{}: {}", self.error_code, self.message),
        }
    }
}

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("{0}")]
    Api(ApiError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),
}

impl From<ApiError> for MuxError {
    fn from(value: ApiError) -> Self {
        Self::Api(value)
    }
}

impl MuxError {
    pub fn code(&self) -> ErrorCode {
        match self {
            MuxError::Api(err) => err.error_code,
            MuxError::Io(_) => ErrorCode::IoError,
            MuxError::Regex(_) => ErrorCode::InvalidArgument,
        }
    }
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::AlreadyExists => "ALREADY_EXISTS",
            ErrorCode::ConnectTimeout => "CONNECT_TIMEOUT",
            ErrorCode::ConnectFailed => "CONNECT_FAILED",
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::NegotiationFailed => "NEGOTIATION_FAILED",
            ErrorCode::BindFailed => "BIND_FAILED",
            ErrorCode::ChannelFailed => "CHANNEL_FAILED",
            ErrorCode::ProtocolViolation => "PROTOCOL_VIOLATION",
            ErrorCode::CommandFailed => "COMMAND_FAILED",
            ErrorCode::IoError => "IO_ERROR",
            ErrorCode::RemoteClosed => "REMOTE_CLOSED",
            ErrorCode::Unsupported => "UNSUPPORTED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type MuxResult<T> = Result<T, MuxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_survives_conversion() {
        let err: MuxError = ApiError::new(ErrorCode::BindFailed, "Address in use").into();
        assert_eq!(err.code(), ErrorCode::BindFailed);
        assert_eq!(err.to_string(), "BIND_FAILED: Address in use");

        let io: MuxError = std::io::Error::other("boom").into();
        assert_eq!(io.code(), ErrorCode::IoError);
    }

    #[test]
    fn error_code_serializes_screaming_snake() {
        let text = serde_json::to_string(&ErrorCode::NegotiationFailed).unwrap();
        assert_eq!(text, "\"NEGOTIATION_FAILED\"");
    }
}
