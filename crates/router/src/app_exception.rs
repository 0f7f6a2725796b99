//! Application-level error replies

use std::fmt;

/// Kind of application error carried in a local reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppExceptionType {
    Unknown,
    UnknownMethod,
    InvalidMessageType,
    WrongMethodName,
    BadSequenceId,
    MissingResult,
    InternalError,
    ProtocolError,
    InvalidTransform,
    InvalidProtocol,
    UnsupportedClientType,
}

impl AppExceptionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppExceptionType::Unknown => "unknown",
            AppExceptionType::UnknownMethod => "unknown_method",
            AppExceptionType::InvalidMessageType => "invalid_message_type",
            AppExceptionType::WrongMethodName => "wrong_method_name",
            AppExceptionType::BadSequenceId => "bad_sequence_id",
            AppExceptionType::MissingResult => "missing_result",
            AppExceptionType::InternalError => "internal_error",
            AppExceptionType::ProtocolError => "protocol_error",
            AppExceptionType::InvalidTransform => "invalid_transform",
            AppExceptionType::InvalidProtocol => "invalid_protocol",
            AppExceptionType::UnsupportedClientType => "unsupported_client_type",
        }
    }
}

/// Error reply synthesized by the router instead of an upstream response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppException {
    exception_type: AppExceptionType,
    message: String,
}

impl AppException {
    pub fn new(exception_type: AppExceptionType, message: impl Into<String>) -> Self {
        Self {
            exception_type,
            message: message.into(),
        }
    }

    pub fn exception_type(&self) -> AppExceptionType {
        self.exception_type
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for AppException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.exception_type.as_str(), self.message)
    }
}

impl std::error::Error for AppException {}
