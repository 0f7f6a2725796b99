//! Newline-delimited text codec
//!
//! Requests: `<service> <method> [key=value ...]\n`
//! Responses: `<code> "<message>" [key=value ...]\n`
//!
//! The request property `path` backs [`Request::path`]. A response carrying
//! `connection=close` asks for the connection to be closed after the write.

use bytes::{BufMut, BytesMut};
use std::collections::BTreeMap;
use tracing::{debug, trace, warn};

use super::{
    CodecFactory, MessageCreator, Request, RequestDecoder, RequestDecoderCallbacks, Response,
    ResponseEncoder, ResponseEncoderCallbacks, ResponsePtr, Status, StreamBase,
};

pub const CODEC_NAME: &str = "text";

/// Longest line accepted before the connection is treated as malformed
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Property copied from a request onto the replies built for it
const REQUEST_ID_KEY: &str = "id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextRequest {
    service: String,
    method: String,
    properties: BTreeMap<String, String>,
}

impl TextRequest {
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: &str, value: &str) -> Self {
        self.properties.insert(key.to_string(), value.to_string());
        self
    }

    /// Parse one line without its terminator
    pub fn parse(line: &str) -> Option<Self> {
        let mut tokens = line.split_ascii_whitespace();
        let service = tokens.next()?;
        let method = tokens.next()?;
        let mut request = Self::new(service, method);
        for token in tokens {
            let (key, value) = token.split_once('=')?;
            if key.is_empty() {
                return None;
            }
            request.properties.insert(key.to_string(), value.to_string());
        }
        Some(request)
    }
}

impl StreamBase for TextRequest {
    fn protocol(&self) -> &str {
        CODEC_NAME
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    fn set(&mut self, key: &str, value: &str) {
        self.properties.insert(key.to_string(), value.to_string());
    }

    fn erase(&mut self, key: &str) {
        self.properties.remove(key);
    }

    fn for_each(&self, callback: &mut dyn FnMut(&str, &str) -> bool) {
        for (key, value) in &self.properties {
            if !callback(key, value) {
                break;
            }
        }
    }
}

impl Request for TextRequest {
    fn host(&self) -> &str {
        &self.service
    }

    fn path(&self) -> &str {
        self.get("path").unwrap_or("")
    }

    fn method(&self) -> &str {
        &self.method
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextResponse {
    status: Status,
    properties: BTreeMap<String, String>,
}

impl TextResponse {
    pub fn new(status: Status) -> Self {
        Self {
            status,
            properties: BTreeMap::new(),
        }
    }

    /// Parse one response line without its terminator
    pub fn parse(line: &str) -> Option<Self> {
        let (code, rest) = line.trim_start().split_once(' ')?;
        let code = code.parse().ok()?;
        let (message, rest) = unescape_message(rest.trim_start())?;

        let mut response = Self::new(Status::new(code, message));
        for token in rest.split_ascii_whitespace() {
            let (key, value) = token.split_once('=')?;
            if key.is_empty() {
                return None;
            }
            response.properties.insert(key.to_string(), value.to_string());
        }
        Some(response)
    }

    /// Render the wire line, terminator included
    pub fn to_line(&self) -> String {
        let mut line = format!(
            "{} \"{}\"",
            self.status.code(),
            escape_message(self.status.message())
        );
        for (key, value) in &self.properties {
            line.push(' ');
            line.push_str(key);
            line.push('=');
            line.push_str(value);
        }
        line.push('\n');
        line
    }
}

impl StreamBase for TextResponse {
    fn protocol(&self) -> &str {
        CODEC_NAME
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    fn set(&mut self, key: &str, value: &str) {
        self.properties.insert(key.to_string(), value.to_string());
    }

    fn erase(&mut self, key: &str) {
        self.properties.remove(key);
    }

    fn for_each(&self, callback: &mut dyn FnMut(&str, &str) -> bool) {
        for (key, value) in &self.properties {
            if !callback(key, value) {
                break;
            }
        }
    }
}

impl Response for TextResponse {
    fn status(&self) -> &Status {
        &self.status
    }
}

fn escape_message(message: &str) -> String {
    let mut escaped = String::with_capacity(message.len());
    for c in message.chars() {
        match c {
            '"' => escaped.push_str("\\\""),
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Read a quoted message, returning it and the text after the closing quote
fn unescape_message(input: &str) -> Option<(String, &str)> {
    let body = input.strip_prefix('"')?;
    let mut message = String::new();
    let mut chars = body.char_indices();
    while let Some((index, c)) = chars.next() {
        match c {
            '"' => return Some((message, &body[index + 1..])),
            '\\' => match chars.next()?.1 {
                'n' => message.push('\n'),
                'r' => message.push('\r'),
                other => message.push(other),
            },
            c => message.push(c),
        }
    }
    None
}

#[derive(Debug, Default)]
pub struct TextRequestDecoder;

impl RequestDecoder for TextRequestDecoder {
    fn decode(&mut self, buffer: &mut BytesMut, callbacks: &dyn RequestDecoderCallbacks) {
        loop {
            let Some(end) = buffer.iter().position(|&b| b == b'\n') else {
                if buffer.len() > MAX_LINE_LENGTH {
                    warn!(buffered = buffer.len(), "Request line exceeds maximum length");
                    buffer.clear();
                    callbacks.on_decoding_failure();
                }
                return;
            };

            let frame = buffer.split_to(end + 1);
            let line = match std::str::from_utf8(&frame[..end]) {
                Ok(line) => line.trim_end_matches('\r'),
                Err(_) => {
                    debug!("Request line is not valid UTF-8");
                    buffer.clear();
                    callbacks.on_decoding_failure();
                    return;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            match TextRequest::parse(line) {
                Some(request) => {
                    trace!(bytes = frame.len(), "Decoded request line");
                    callbacks.on_decoding_success(Box::new(request));
                }
                None => {
                    debug!(line = %line, "Malformed request line");
                    buffer.clear();
                    callbacks.on_decoding_failure();
                    return;
                }
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct TextResponseEncoder;

impl ResponseEncoder for TextResponseEncoder {
    fn encode(&mut self, response: &dyn Response, callbacks: &dyn ResponseEncoderCallbacks) {
        let mut line = format!(
            "{} \"{}\"",
            response.status().code(),
            escape_message(response.status().message())
        );
        response.for_each(&mut |key, value| {
            line.push(' ');
            line.push_str(key);
            line.push('=');
            line.push_str(value);
            true
        });
        line.push('\n');

        let mut buffer = BytesMut::with_capacity(line.len());
        buffer.put_slice(line.as_bytes());
        let close = response.get("connection") == Some("close");
        callbacks.on_encoding_success(&mut buffer, close);
    }
}

#[derive(Debug, Default)]
pub struct TextMessageCreator;

impl MessageCreator for TextMessageCreator {
    fn response(&self, status: Status, origin: &dyn Request) -> ResponsePtr {
        let mut response = TextResponse::new(status);
        if let Some(id) = origin.get(REQUEST_ID_KEY) {
            response.set(REQUEST_ID_KEY, id);
        }
        Box::new(response)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TextCodecFactory;

impl CodecFactory for TextCodecFactory {
    fn name(&self) -> &str {
        CODEC_NAME
    }

    fn request_decoder(&self) -> Box<dyn RequestDecoder> {
        Box::new(TextRequestDecoder)
    }

    fn response_encoder(&self) -> Box<dyn ResponseEncoder> {
        Box::new(TextResponseEncoder)
    }

    fn message_creator(&self) -> Option<Box<dyn MessageCreator>> {
        Some(Box::new(TextMessageCreator))
    }
}
