//! Codec contracts
//!
//! A codec turns downstream bytes into [`Request`]s and [`Response`]s back
//! into bytes. The proxy never looks at the wire format itself; it only sees
//! the key/value surface defined here.

pub mod text;

use bytes::BytesMut;
use std::fmt;

use crate::error::{ProxyError, Result};

/// Protocol-neutral status code carried by responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    PermissionDenied,
    ResourceExhausted,
    Unavailable,
    Unimplemented,
    Internal,
}

impl StatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::Ok => "ok",
            StatusCode::Cancelled => "cancelled",
            StatusCode::Unknown => "unknown",
            StatusCode::InvalidArgument => "invalid_argument",
            StatusCode::DeadlineExceeded => "deadline_exceeded",
            StatusCode::NotFound => "not_found",
            StatusCode::PermissionDenied => "permission_denied",
            StatusCode::ResourceExhausted => "resource_exhausted",
            StatusCode::Unavailable => "unavailable",
            StatusCode::Unimplemented => "unimplemented",
            StatusCode::Internal => "internal",
        }
    }
}

impl std::str::FromStr for StatusCode {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.to_lowercase().as_str() {
            "ok" => StatusCode::Ok,
            "cancelled" => StatusCode::Cancelled,
            "unknown" => StatusCode::Unknown,
            "invalid_argument" => StatusCode::InvalidArgument,
            "deadline_exceeded" => StatusCode::DeadlineExceeded,
            "not_found" => StatusCode::NotFound,
            "permission_denied" => StatusCode::PermissionDenied,
            "resource_exhausted" => StatusCode::ResourceExhausted,
            "unavailable" => StatusCode::Unavailable,
            "unimplemented" => StatusCode::Unimplemented,
            "internal" => StatusCode::Internal,
            _ => return Err(ProxyError::InvalidStatus(s.to_string())),
        })
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status code plus a human readable message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    code: StatusCode,
    message: String,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(StatusCode::Ok, "")
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }
}

/// Key/value surface shared by requests and responses
pub trait StreamBase {
    /// Name of the protocol that produced this frame
    fn protocol(&self) -> &str;
    fn get(&self, key: &str) -> Option<&str>;
    fn set(&mut self, key: &str, value: &str);
    fn erase(&mut self, key: &str);
    /// Visit every entry until the callback returns false
    fn for_each(&self, callback: &mut dyn FnMut(&str, &str) -> bool);
}

pub trait Request: StreamBase {
    /// Target service
    fn host(&self) -> &str;
    fn path(&self) -> &str;
    fn method(&self) -> &str;
}

pub trait Response: StreamBase {
    fn status(&self) -> &Status;
}

pub type RequestPtr = Box<dyn Request>;
pub type ResponsePtr = Box<dyn Response>;

pub trait RequestDecoderCallbacks {
    fn on_decoding_success(&self, request: RequestPtr);
    fn on_decoding_failure(&self);
}

/// Incremental request decoder, fed every chunk read from the connection
pub trait RequestDecoder {
    /// Consume as many complete frames as `buffer` holds
    fn decode(&mut self, buffer: &mut BytesMut, callbacks: &dyn RequestDecoderCallbacks);
}

pub trait ResponseEncoderCallbacks {
    /// Encoded bytes are ready; `close_connection` asks for the connection to
    /// be closed once they are flushed
    fn on_encoding_success(&self, buffer: &mut BytesMut, close_connection: bool);
}

pub trait ResponseEncoder {
    fn encode(&mut self, response: &dyn Response, callbacks: &dyn ResponseEncoderCallbacks);
}

/// Builds responses the proxy answers with on its own
pub trait MessageCreator {
    fn response(&self, status: Status, origin: &dyn Request) -> ResponsePtr;
}

/// Produces the per-connection codec objects for one protocol
pub trait CodecFactory: Send + Sync {
    fn name(&self) -> &str;
    fn request_decoder(&self) -> Box<dyn RequestDecoder>;
    fn response_encoder(&self) -> Box<dyn ResponseEncoder>;
    fn message_creator(&self) -> Option<Box<dyn MessageCreator>>;
}

/// Look up a codec factory by its configured name
pub fn codec_factory(name: &str) -> Result<std::sync::Arc<dyn CodecFactory>> {
    match name {
        text::CODEC_NAME => Ok(std::sync::Arc::new(text::TextCodecFactory)),
        other => Err(ProxyError::UnknownCodec(other.to_string())),
    }
}
